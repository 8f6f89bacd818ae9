//! Application-facing message records.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::trace;

use crate::types::PropertyValue;

/// Lifecycle of an outbound message
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageStatus {
    /// Queued locally, not yet handed to the wire
    Unsent,
    /// Handed to the wire, settlement outstanding
    Sent,
    /// Remote peer accepted the delivery
    Acknowledged,
    /// Undeliverable: remote rejection, encode failure, or link teardown
    Rejected,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Acknowledged | MessageStatus::Rejected)
    }
}

type CompletionHook = Box<dyn FnOnce(MessageStatus) + Send>;

/// An outbound application message addressed to a peer queue.
///
/// Every message admitted to [`crate::Connection::write_message`] reaches a
/// terminal status exactly once; the completion hook, if any, fires at that
/// transition and never again.
pub struct SendableMessage {
    topic: String,
    payload: Bytes,
    properties: Vec<(String, PropertyValue)>,
    /// Encoded wire form, held only between encode and hand-off to the wire
    buf: Option<Bytes>,
    status: MessageStatus,
    hook: Option<CompletionHook>,
}

impl SendableMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            properties: Vec::new(),
            buf: None,
            status: MessageStatus::Unsent,
            hook: None,
        }
    }

    /// Attach one application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Register a hook fired exactly once when the message reaches a
    /// terminal status
    pub fn on_complete(mut self, hook: impl FnOnce(MessageStatus) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn properties(&self) -> &[(String, PropertyValue)] {
        &self.properties
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub(crate) fn attach_buf(&mut self, buf: Bytes) {
        self.buf = Some(buf);
    }

    /// Hand the encoded bytes to the wire, leaving the record in the
    /// unacked queue without its buffer
    pub(crate) fn take_buf(&mut self) -> Option<Bytes> {
        self.buf.take()
    }

    pub(crate) fn mark_sent(&mut self) {
        if self.status == MessageStatus::Unsent {
            self.status = MessageStatus::Sent;
        }
    }

    /// Drop the encoded buffer. Idempotent.
    pub(crate) fn release(&mut self) {
        self.buf = None;
    }

    /// Terminal transition. Idempotent: the first terminal status wins and
    /// later calls are ignored.
    pub(crate) fn complete(&mut self, status: MessageStatus) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            trace!(topic = %self.topic, ?status, "message already completed");
            return;
        }
        self.status = status;
        self.release();
        if let Some(hook) = self.hook.take() {
            hook(status);
        }
    }
}

impl fmt::Debug for SendableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendableMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Opaque identifier of an inbound delivery, used to settle it once the
/// upstream consumer has processed the message
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DeliveryHandle(pub(crate) u32);

/// An inbound application message, decoded and attributed.
///
/// `properties` always carries the authenticated remote identity under
/// [`crate::VALIDATED_USER_KEY`]; any peer-supplied value for that key is
/// discarded before the record is surfaced.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    /// Address the message was sent to
    pub topic: String,
    pub remote_legal_name: String,
    pub remote_address: SocketAddr,
    pub local_legal_name: String,
    pub local_address: SocketAddr,
    pub properties: Vec<(String, PropertyValue)>,
    /// Settle with [`crate::Connection::complete_received`] when processed
    pub delivery: DeliveryHandle,
}

impl ReceivedMessage {
    /// Application property lookup by key
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn complete_fires_hook_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let mut msg = SendableMessage::new("addr1", Bytes::from_static(&[1]))
            .on_complete(move |status| {
                assert_eq!(status, MessageStatus::Acknowledged);
                observer.fetch_add(1, Ordering::SeqCst);
            });
        msg.attach_buf(Bytes::from_static(&[0]));
        msg.complete(MessageStatus::Acknowledged);
        msg.complete(MessageStatus::Rejected);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(msg.status(), MessageStatus::Acknowledged);
        assert!(msg.take_buf().is_none());
    }

    #[test]
    fn release_is_idempotent() {
        let mut msg = SendableMessage::new("addr1", Bytes::new());
        msg.attach_buf(Bytes::from_static(&[9]));
        msg.release();
        msg.release();
        assert!(msg.take_buf().is_none());
    }
}
