//! Protocol state and logic for a single peer link.
//!
//! A [`Connection`] consumes inbound byte chunks and engine events and
//! produces outbound byte chunks plus application [`Event`]s. It has three
//! kinds of methods: ingress operations from the application
//! (`write_message`, `complete_received`, `close`), the transport pump
//! (`process_input`, `poll_output`, `process`, `handle_timeout`), and
//! polling (`poll`, `poll_timeout`). After any ingress or pump call, drain
//! `poll_output` and `poll` before going back to sleep.
//!
//! Messages admitted by [`Connection::write_message`] always reach exactly
//! one terminal status: `Acknowledged` when the peer accepts the delivery,
//! `Rejected` on encode failure, remote rejection, or link teardown. The
//! connection-final cleanup drains every queue even after an abrupt
//! transport loss.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, error, info_span, trace, warn, Span};
use uuid::Uuid;

use crate::codec;
use crate::engine::{DeliveryId, Engine, Event as EngineEvent, LinkId, SaslConfig};
use crate::frame::{ErrorCondition, Role};
use crate::message::{DeliveryHandle, MessageStatus, ReceivedMessage, SendableMessage};
use crate::types::PropertyValue;
use crate::{ConnectionConfig, Side, ADDRESS_CREATE_REFUSED, VALIDATED_USER_KEY};

mod links;
mod queues;
mod session;

use links::LinkRegistry;
use queues::OutboundQueues;
use session::SessionState;

/// Application-facing events
#[derive(Debug)]
pub enum Event {
    /// A message arrived and was attributed to the authenticated peer
    Received(ReceivedMessage),
    /// The connection finished tearing down; all queues are drained
    Closed,
}

/// State machine for one AMQP 1.0 peer link
pub struct Connection {
    side: Side,
    local_legal_name: String,
    remote_legal_name: String,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    engine: Engine,
    engine_id: u64,
    session: SessionState,
    links: LinkRegistry,
    queues: OutboundQueues,
    /// Delivery tags are a connection-local counter, never reused
    next_tag: u32,
    /// Whether an upstream channel is still attached to receive messages
    attached: bool,
    finalized: bool,
    events: VecDeque<Event>,
    span: Span,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let sasl = match config.username {
            Some(username) => SaslConfig::Plain {
                username,
                password: config.password.unwrap_or_default(),
            },
            None => SaslConfig::Anonymous,
        };
        let engine = Engine::new(
            config.side,
            sasl,
            config.max_frame_size,
            config.idle_timeout,
            config.link_credit,
        );
        let engine_id = engine.id();
        let span = info_span!(
            "amqp",
            side = %config.side,
            local = %config.local_legal_name,
            remote = %config.remote_legal_name,
            id = engine_id,
        );
        let mut connection = Self {
            side: config.side,
            local_legal_name: config.local_legal_name,
            remote_legal_name: config.remote_legal_name,
            local_address: config.local_address,
            remote_address: config.remote_address,
            engine,
            engine_id,
            session: SessionState::Uninitialized,
            links: LinkRegistry::default(),
            queues: OutboundQueues::default(),
            next_tag: 0,
            attached: true,
            finalized: false,
            events: VecDeque::new(),
            span,
        };
        let _guard = connection.span.clone().entered();
        connection.drive();
        drop(_guard);
        connection
    }

    // Ingress operations

    /// Enqueue an application message for transmission.
    ///
    /// The message completes `Rejected` immediately when it cannot be
    /// encoded or the session is already closed; otherwise it is queued
    /// per-address and transmitted as credit allows.
    pub fn write_message(&mut self, mut message: SendableMessage) {
        let _guard = self.span.clone().entered();
        if self.finalized || self.session.is_closed() {
            debug!(topic = %message.topic(), "write after close rejected");
            message.complete(MessageStatus::Rejected);
            return;
        }
        let encoded = match codec::encode(&message, &self.local_legal_name) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(topic = %message.topic(), error = %e, "message encode failed");
                message.complete(MessageStatus::Rejected);
                return;
            }
        };
        message.attach_buf(encoded);
        let topic = message.topic().to_owned();
        trace!(topic = %topic, "message queued");
        self.queues.push(message);
        if self.session.id().is_some() {
            if let Some(link) = self.get_sender(&topic) {
                self.transmit_messages(link);
            }
        } else {
            trace!(topic = %topic, "session not yet active");
        }
        self.drive();
    }

    /// Feed raw bytes received from the socket.
    ///
    /// Bytes are forwarded in chunks sized to the engine's remaining input
    /// capacity. Any engine failure tags the transport with a `proton:io`
    /// condition and forces the close cascade; cleanup then drains the
    /// queues through the normal close events.
    pub fn process_input(&mut self, now: Instant, bytes: &[u8]) {
        let _guard = self.span.clone().entered();
        let mut offset = 0;
        while offset < bytes.len() {
            let len = self.engine.input_capacity().min(bytes.len() - offset);
            if let Err(e) = self.engine.process_input(now, &bytes[offset..offset + len]) {
                error!(error = %e, "transport input failed");
                self.engine
                    .abort(ErrorCondition::new("proton:io", e.to_string()));
                break;
            }
            offset += len;
        }
        self.drive();
    }

    /// Drain the next chunk of outbound bytes, if any
    #[must_use]
    pub fn poll_output(&mut self) -> Option<bytes::Bytes> {
        let _guard = self.span.clone().entered();
        self.drive();
        self.engine.take_output()
    }

    /// Poke the engine to emit any pending frames
    pub fn process(&mut self) {
        let _guard = self.span.clone().entered();
        self.drive();
    }

    /// Returns application-facing events
    #[must_use]
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Settle an inbound delivery once upstream has processed it
    pub fn complete_received(&mut self, handle: DeliveryHandle, accepted: bool) {
        let _guard = self.span.clone().entered();
        self.engine.disposition(DeliveryId(handle.0), accepted);
        self.drive();
    }

    /// Close the link in an orderly fashion; queued messages fail
    /// `Rejected` once the close cascade completes
    pub fn close(&mut self) {
        let _guard = self.span.clone().entered();
        debug!("closing locally");
        self.engine.close(None);
        self.drive();
    }

    /// Returns the next time at which `handle_timeout` should be called
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.engine.poll_timeout()
    }

    /// Process timer expirations: idle-timeout enforcement and heartbeats
    pub fn handle_timeout(&mut self, now: Instant) {
        let _guard = self.span.clone().entered();
        self.engine.handle_timeout(now);
        self.drive();
    }

    // Accessors

    pub fn side(&self) -> Side {
        self.side
    }

    /// Whether teardown has completed and all queues are drained
    pub fn is_closed(&self) -> bool {
        self.finalized
    }

    /// Container id announced to the peer
    pub fn container_id(&self) -> &str {
        self.engine.container_id()
    }

    /// Container id announced by the peer, once open
    pub fn remote_container_id(&self) -> Option<&str> {
        self.engine.remote_container_id()
    }

    /// Idle timeout announced by the peer, once open
    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.engine.remote_idle_timeout()
    }

    /// Number of messages queued for `address` and not yet on the wire
    pub fn queue_depth(&self, address: &str) -> usize {
        self.queues.depth(address)
    }

    #[cfg(test)]
    pub(crate) fn queues_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn unacked_len(&self) -> usize {
        self.queues.unacked_len()
    }

    #[cfg(test)]
    pub(crate) fn registry_empty(&self) -> bool {
        self.links.is_empty()
    }

    // Event pump

    fn drive(&mut self) {
        loop {
            while let Some(event) = self.engine.pop_event() {
                self.dispatch(event);
            }
            self.engine.generate();
            if !self.engine.has_events() {
                break;
            }
        }
    }

    fn dispatch(&mut self, event: EngineEvent) {
        debug_assert_eq!(self.engine.id(), self.engine_id, "event for a stale engine");
        use EngineEvent::*;
        match event {
            ConnectionInit => debug!("connection initialized"),
            ConnectionLocalOpen => self.on_connection_local_open(),
            ConnectionRemoteOpen => trace!("remote connection open"),
            ConnectionLocalClose => debug!("local connection close"),
            ConnectionRemoteClose => match self.engine.remote_close_condition() {
                Some(condition) => debug!(condition = %condition, "remote connection close"),
                None => trace!("remote connection close"),
            },
            ConnectionUnbound => {
                if self.attached {
                    debug!("connection unbound; detaching channel");
                    self.attached = false;
                }
            }
            ConnectionFinal => self.on_connection_final(),
            SessionInit(id) => trace!(session = ?id, "session init"),
            SessionLocalOpen(id) => trace!(session = ?id, "session local open"),
            SessionRemoteOpen(id) => trace!(session = ?id, "session remote open"),
            SessionLocalClose(id) => debug!(session = ?id, "session local close"),
            SessionRemoteClose(id) => trace!(session = ?id, "session remote close"),
            SessionFinal(id) => self.on_session_final(id),
            LinkLocalOpen(id) => self.on_link_local_open(id),
            LinkRemoteOpen(id) => {
                if self.engine.link_is_coordinator(id) {
                    debug!(link = ?id, "transaction coordinator attached");
                } else {
                    trace!(link = ?id, "remote link open");
                }
            }
            LinkRemoteClose(id) => self.on_link_remote_close(id),
            LinkFinal {
                link,
                role,
                address,
            } => {
                trace!(link = ?link, "link finalized");
                if let Some(ref address) = address {
                    self.links.remove(role, address, link);
                }
            }
            LinkFlow(id) => {
                if self.engine.link_role(id) == Some(Role::Sender)
                    && self.engine.sender_credit(id) > 0
                {
                    self.transmit_messages(id);
                }
            }
            Delivery(id) => self.on_delivery(id),
            Transport => self.on_transport(),
            TransportError => match self.engine.transport_condition() {
                Some(condition) => warn!(condition = %condition, "transport error"),
                None => warn!("transport error without condition"),
            },
            TransportHeadClosed => {
                trace!("transport head closed");
                self.engine.close_tail();
            }
            TransportTailClosed => {
                trace!("transport tail closed");
                self.engine.close_head();
            }
            TransportClosed => {
                trace!("transport closed");
                self.engine.unbind();
            }
        }
    }

    // Handlers

    fn on_connection_local_open(&mut self) {
        debug!("connection open");
        let session = self.engine.session_open();
        self.session.init(session);
        // pre-open senders for anything enqueued before the session came up
        for address in self.queues.addresses() {
            self.get_sender(&address);
        }
    }

    fn on_connection_final(&mut self) {
        debug!("connection final; draining queues");
        for mut message in self.queues.drain_all() {
            message.complete(MessageStatus::Rejected);
        }
        self.links.clear();
        self.session.close();
        self.attached = false;
        if !self.finalized {
            self.finalized = true;
            self.events.push_back(Event::Closed);
        }
    }

    fn on_session_final(&mut self, id: crate::engine::SessionId) {
        if self.session.id() == Some(id) {
            debug!(session = ?id, "session final");
            self.session.close();
        } else {
            trace!(session = ?id, "final for a session we do not own");
        }
        // a disconnection before the remote session opened never surfaces
        // transport-closed; force it so connection-final always follows
        self.engine.force_transport_close();
    }

    fn on_link_local_open(&mut self, id: LinkId) {
        let address = self.engine.link_address(id).map(str::to_owned);
        match self.engine.link_role(id) {
            Some(Role::Sender) => {
                if let Some(ref address) = address {
                    trace!(address = %address, "outbound link open");
                    self.links.insert_sender(address, id);
                }
                self.transmit_messages(id);
            }
            Some(Role::Receiver) => {
                if let Some(ref address) = address {
                    debug!(address = %address, "inbound link open");
                    self.links.insert_receiver(address, id);
                }
            }
            None => trace!(link = ?id, "local open for unknown link"),
        }
    }

    fn on_link_remote_close(&mut self, id: LinkId) {
        match self.engine.link_remote_condition(id).cloned() {
            Some(condition) => {
                warn!(condition = %condition, "remote link closed with error");
                let refused = condition
                    .description
                    .as_deref()
                    .map_or(false, |d| d.contains(ADDRESS_CREATE_REFUSED));
                if refused {
                    if let Some(address) = self.engine.link_address(id).map(str::to_owned) {
                        self.handle_remote_create_permission_error(&address);
                    }
                }
                self.engine.abort(condition);
            }
            None => debug!(link = ?id, "remote link closed"),
        }
    }

    /// The peer refuses to create the destination address. Retrying can
    /// never succeed, so queued messages are marked `Acknowledged` and the
    /// queue is cleared rather than retried forever.
    fn handle_remote_create_permission_error(&mut self, address: &str) {
        warn!(address = %address, "peer cannot create address; abandoning queued messages");
        for mut message in self.queues.take_queue(address) {
            message.complete(MessageStatus::Acknowledged);
        }
    }

    fn on_delivery(&mut self, id: DeliveryId) {
        let Some(link) = self.engine.delivery_link(id) else {
            trace!(delivery = ?id, "event for a settled delivery");
            return;
        };
        if self.engine.delivery_is_incoming(id) {
            self.on_inbound_delivery(link, id);
        } else {
            self.on_settlement(id);
        }
    }

    fn on_inbound_delivery(&mut self, link: LinkId, id: DeliveryId) {
        if !self.engine.delivery_readable(id) || self.engine.delivery_partial(id) {
            return;
        }
        let Some(bytes) = self.engine.recv(id) else {
            return;
        };
        match codec::decode(bytes) {
            Err(e) => {
                warn!(error = %e, "undecodable inbound message; rejecting");
                self.engine.disposition(id, false);
            }
            Ok(decoded) => {
                if !self.attached {
                    debug!("no channel attached; rejecting delivery in place");
                    self.engine.disposition(id, false);
                    return;
                }
                let topic = self
                    .engine
                    .link_address(link)
                    .unwrap_or_default()
                    .to_owned();
                let mut properties = decoded.properties;
                // the peer does not get to assert its own identity
                properties.retain(|(key, _)| key != VALIDATED_USER_KEY);
                properties.push((
                    VALIDATED_USER_KEY.to_owned(),
                    PropertyValue::String(self.remote_legal_name.clone()),
                ));
                trace!(topic = %topic, bytes = decoded.payload.len(), "message received");
                self.events.push_back(Event::Received(ReceivedMessage {
                    payload: decoded.payload,
                    topic,
                    remote_legal_name: self.remote_legal_name.clone(),
                    remote_address: self.remote_address,
                    local_legal_name: self.local_legal_name.clone(),
                    local_address: self.local_address,
                    properties,
                    delivery: DeliveryHandle(id.0),
                }));
                self.engine.receiver_advance(link, id);
            }
        }
    }

    fn on_settlement(&mut self, id: DeliveryId) {
        if !self.engine.delivery_remotely_settled(id) {
            trace!(delivery = ?id, "disposition without settlement");
            return;
        }
        let status = if self.engine.delivery_remote_accepted(id) {
            MessageStatus::Acknowledged
        } else {
            MessageStatus::Rejected
        };
        match self.queues.remove_unacked(id) {
            Some(mut message) => {
                debug!(topic = %message.topic(), ?status, "delivery settled");
                message.complete(status);
            }
            None => trace!(delivery = ?id, "settlement for unknown delivery"),
        }
        self.engine.settle(id);
    }

    fn on_transport(&mut self) {
        // output, if any, is drained by the caller through poll_output; a
        // transport that closed without its own event still needs cleanup
        if self.engine.is_transport_closed() && !self.engine.is_unbound() {
            self.engine.unbind();
        }
    }

    // Transmission

    /// Return the open sender for `address`, creating one lazily on the
    /// active session
    fn get_sender(&mut self, address: &str) -> Option<LinkId> {
        if let Some(link) = self.links.sender(address) {
            return Some(link);
        }
        self.session.id()?;
        let name = Uuid::new_v4().to_string();
        debug!(address = %address, name = %name, "opening sender");
        let link = self.engine.sender_open(&name, address);
        self.links.insert_sender(address, link);
        Some(link)
    }

    /// Move queued messages onto the wire while the sender has credit
    fn transmit_messages(&mut self, link: LinkId) {
        let Some(address) = self.engine.link_address(link).map(str::to_owned) else {
            return;
        };
        while self.engine.sender_credit(link) > 0 {
            let Some(mut message) = self.queues.pop_front(&address) else {
                break;
            };
            let tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1);
            // the encoded buffer is released on every path out of this
            // block: handed to the engine, or dropped with the completion
            match message.take_buf() {
                Some(buf) => match self.engine.send(link, tag.to_be_bytes(), buf) {
                    Some(delivery) => {
                        trace!(topic = %address, tag, "message sent");
                        message.mark_sent();
                        self.queues.push_unacked(delivery, message);
                    }
                    None => {
                        warn!(topic = %address, "send refused by the engine");
                        message.complete(MessageStatus::Rejected);
                    }
                },
                None => {
                    warn!(topic = %address, "queued message without an encoded buffer");
                    message.complete(MessageStatus::Rejected);
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // terminal-once holds even if the driving loop is torn down without
        // a final transport event
        for mut message in self.queues.drain_all() {
            message.complete(MessageStatus::Rejected);
        }
    }
}
