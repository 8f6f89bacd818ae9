//! Outbound message queues.
//!
//! Two homes for a message, never both at once: the per-address pending
//! queue (FIFO by enqueue order) and the unacked queue (FIFO by send order,
//! random-access removal by delivery identity when settlement arrives).

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::engine::DeliveryId;
use crate::message::SendableMessage;

#[derive(Default)]
pub(crate) struct OutboundQueues {
    pending: FxHashMap<String, VecDeque<SendableMessage>>,
    unacked: VecDeque<(DeliveryId, SendableMessage)>,
}

impl OutboundQueues {
    pub(crate) fn push(&mut self, message: SendableMessage) {
        self.pending
            .entry(message.topic().to_owned())
            .or_default()
            .push_back(message);
    }

    pub(crate) fn pop_front(&mut self, address: &str) -> Option<SendableMessage> {
        let queue = self.pending.get_mut(address)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(address);
        }
        message
    }

    /// Addresses that currently have messages waiting
    pub(crate) fn addresses(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    /// Remove and return the whole pending queue for `address`
    pub(crate) fn take_queue(&mut self, address: &str) -> VecDeque<SendableMessage> {
        self.pending.remove(address).unwrap_or_default()
    }

    pub(crate) fn push_unacked(&mut self, delivery: DeliveryId, message: SendableMessage) {
        self.unacked.push_back((delivery, message));
    }

    /// Remove an in-flight message by the identity of its delivery
    pub(crate) fn remove_unacked(&mut self, delivery: DeliveryId) -> Option<SendableMessage> {
        let index = self.unacked.iter().position(|(d, _)| *d == delivery)?;
        self.unacked.remove(index).map(|(_, m)| m)
    }

    /// Drain everything, pending queues first, then in-flight messages
    pub(crate) fn drain_all(&mut self) -> Vec<SendableMessage> {
        let mut drained = Vec::new();
        for (_, queue) in self.pending.drain() {
            drained.extend(queue);
        }
        drained.extend(self.unacked.drain(..).map(|(_, m)| m));
        drained
    }

    pub(crate) fn depth(&self, address: &str) -> usize {
        self.pending.get(address).map_or(0, VecDeque::len)
    }

    pub(crate) fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.unacked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn message(topic: &str, tag: u8) -> SendableMessage {
        SendableMessage::new(topic, Bytes::copy_from_slice(&[tag]))
    }

    #[test]
    fn per_address_fifo() {
        let mut queues = OutboundQueues::default();
        queues.push(message("a", 1));
        queues.push(message("b", 2));
        queues.push(message("a", 3));
        assert_eq!(queues.depth("a"), 2);
        assert_eq!(queues.pop_front("a").unwrap().payload()[0], 1);
        assert_eq!(queues.pop_front("a").unwrap().payload()[0], 3);
        assert!(queues.pop_front("a").is_none());
        assert_eq!(queues.depth("b"), 1);
    }

    #[test]
    fn unacked_removal_by_identity() {
        let mut queues = OutboundQueues::default();
        queues.push_unacked(DeliveryId(0), message("a", 1));
        queues.push_unacked(DeliveryId(1), message("a", 2));
        queues.push_unacked(DeliveryId(2), message("a", 3));
        // settlement order is not send order under failure
        let second = queues.remove_unacked(DeliveryId(1)).unwrap();
        assert_eq!(second.payload()[0], 2);
        assert!(queues.remove_unacked(DeliveryId(1)).is_none());
        assert_eq!(queues.unacked_len(), 2);
    }

    #[test]
    fn drain_empties_everything() {
        let mut queues = OutboundQueues::default();
        queues.push(message("a", 1));
        queues.push(message("b", 2));
        queues.push_unacked(DeliveryId(7), message("a", 3));
        let drained = queues.drain_all();
        assert_eq!(drained.len(), 3);
        assert!(queues.is_empty());
    }
}
