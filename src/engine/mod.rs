//! Embedded AMQP 1.0 engine.
//!
//! Owns the wire-level endpoint state for one connection: SASL, the
//! open/begin/attach handshakes, credit accounting, deliveries, and the
//! transport close cascade. It is driven entirely by [`Engine::process_input`],
//! the operations the orchestrating state machine invokes, and time. Frames
//! are never written eagerly: [`Engine::generate`] derives due output from
//! endpoint state, so ordering (header, open, begin, attach, flow,
//! transfer, ...) falls out of the state flags rather than call order.
//!
//! Every endpoint object is addressed by an integer id. Events carry ids,
//! and lookups that miss mean the event raced object teardown; callers log
//! and drop those instead of trusting stale state.

mod sasl;
pub(crate) use sasl::SaslConfig;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::frame::{
    self, Attach, Begin, Close, Detach, Disposition, DeliveryState, End, ErrorCondition, Flow,
    Open, Performative, RawFrame, ReceiverSettleMode, Role, SenderSettleMode, Source, Target,
    TerminusDurability, Transfer, FRAME_TYPE_AMQP, FRAME_TYPE_SASL,
};
use crate::types::ParseError;
use crate::{Side, CONTAINER_ID_PREFIX, MIN_MAX_FRAME_SIZE};

const SESSION_WINDOW: u32 = i32::MAX as u32;
const CHANNEL: u16 = 0;
/// Headroom reserved for the transfer performative when chunking payloads
const TRANSFER_OVERHEAD: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct SessionId(u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct LinkId(u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct DeliveryId(pub(crate) u32);

/// Engine events, dispatched by the connection state machine
#[derive(Debug)]
pub(crate) enum Event {
    ConnectionInit,
    ConnectionLocalOpen,
    ConnectionRemoteOpen,
    ConnectionLocalClose,
    ConnectionRemoteClose,
    ConnectionUnbound,
    ConnectionFinal,
    SessionInit(SessionId),
    SessionLocalOpen(SessionId),
    SessionRemoteOpen(SessionId),
    SessionLocalClose(SessionId),
    SessionRemoteClose(SessionId),
    SessionFinal(SessionId),
    LinkLocalOpen(LinkId),
    LinkRemoteOpen(LinkId),
    LinkRemoteClose(LinkId),
    LinkFlow(LinkId),
    /// Carries the registry key so cleanup can run after the endpoint is gone
    LinkFinal {
        link: LinkId,
        role: Role,
        address: Option<String>,
    },
    Delivery(DeliveryId),
    Transport,
    TransportError,
    TransportHeadClosed,
    TransportTailClosed,
    TransportClosed,
}

#[derive(Error, Debug)]
pub(crate) enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("sasl negotiation failed: {0}")]
    Sasl(#[from] sasl::SaslError),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

struct SessionEp {
    id: SessionId,
    local_open: bool,
    begin_sent: bool,
    remote_open: bool,
    remote_channel: Option<u16>,
    local_close: bool,
    end_sent: bool,
    remote_close: bool,
}

struct LinkEp {
    id: LinkId,
    name: String,
    role: Role,
    address: Option<String>,
    coordinator: bool,
    local_handle: u32,
    remote_handle: Option<u32>,
    source: Source,
    target: Target,
    local_open: bool,
    attach_sent: bool,
    remote_open: bool,
    local_close: bool,
    detach_sent: bool,
    detach_error: Option<ErrorCondition>,
    remote_close: bool,
    remote_condition: Option<ErrorCondition>,
    // sender side
    credit: u32,
    delivery_count: u32,
    // receiver side
    window: u32,
    remote_delivery_count: u32,
    settled_since_flow: u32,
    flow_due: bool,
    current_incoming: Option<DeliveryId>,
}

struct DeliveryEp {
    link: LinkId,
    wire_id: u32,
    incoming: bool,
    payload: BytesMut,
    partial: bool,
    remotely_settled: bool,
    remote_state: Option<DeliveryState>,
}

struct PendingTransfer {
    link: LinkId,
    wire_delivery_id: u32,
    tag: Bytes,
    payload: Bytes,
}

pub(crate) struct Engine {
    id: u64,
    side: Side,
    container_id: String,
    remote_container_id: Option<String>,
    max_frame_size: u32,
    remote_max_frame_size: u32,
    idle_timeout: Duration,
    remote_idle_timeout: Option<Duration>,
    link_credit_window: u32,
    sasl: sasl::Sasl,
    events: VecDeque<Event>,
    out: BytesMut,
    input: BytesMut,
    amqp_header_sent: bool,
    amqp_header_received: bool,
    // connection endpoint
    local_open: bool,
    open_sent: bool,
    remote_open: bool,
    local_close: bool,
    close_sent: bool,
    close_condition: Option<ErrorCondition>,
    remote_close: bool,
    remote_close_condition: Option<ErrorCondition>,
    // single logical session
    session: Option<SessionEp>,
    next_session_id: u32,
    // links
    links: FxHashMap<LinkId, LinkEp>,
    by_remote_handle: FxHashMap<u32, LinkId>,
    next_link_id: u32,
    next_local_handle: u32,
    // deliveries
    deliveries: FxHashMap<DeliveryId, DeliveryEp>,
    out_by_wire_id: FxHashMap<u32, DeliveryId>,
    next_delivery: u32,
    next_outgoing_delivery_id: u32,
    next_outgoing_transfer_id: u32,
    next_incoming_transfer_id: u32,
    pending_transfers: VecDeque<PendingTransfer>,
    pending_dispositions: Vec<Disposition>,
    // transport
    tail_closed: bool,
    head_closed: bool,
    transport_closed: bool,
    unbound: bool,
    finalized: bool,
    condition: Option<ErrorCondition>,
    // timing
    last_input: Option<Instant>,
    next_heartbeat: Option<Instant>,
    heartbeat_due: bool,
}

impl Engine {
    pub(crate) fn new(
        side: Side,
        sasl_config: SaslConfig,
        max_frame_size: u32,
        idle_timeout: Duration,
        link_credit_window: u32,
    ) -> Self {
        let mut engine = Self {
            id: rand::random(),
            side,
            container_id: format!("{}{}", CONTAINER_ID_PREFIX, Uuid::new_v4()),
            remote_container_id: None,
            max_frame_size: max_frame_size.max(MIN_MAX_FRAME_SIZE),
            remote_max_frame_size: MIN_MAX_FRAME_SIZE,
            idle_timeout,
            remote_idle_timeout: None,
            link_credit_window,
            sasl: sasl::Sasl::new(side, sasl_config),
            events: VecDeque::new(),
            out: BytesMut::new(),
            input: BytesMut::new(),
            amqp_header_sent: false,
            amqp_header_received: false,
            local_open: false,
            open_sent: false,
            remote_open: false,
            local_close: false,
            close_sent: false,
            close_condition: None,
            remote_close: false,
            remote_close_condition: None,
            session: None,
            next_session_id: 0,
            links: FxHashMap::default(),
            by_remote_handle: FxHashMap::default(),
            next_link_id: 0,
            next_local_handle: 0,
            deliveries: FxHashMap::default(),
            out_by_wire_id: FxHashMap::default(),
            next_delivery: 0,
            next_outgoing_delivery_id: 0,
            next_outgoing_transfer_id: 0,
            next_incoming_transfer_id: 0,
            pending_transfers: VecDeque::new(),
            pending_dispositions: Vec::new(),
            tail_closed: false,
            head_closed: false,
            transport_closed: false,
            unbound: false,
            finalized: false,
            condition: None,
            last_input: None,
            next_heartbeat: None,
            heartbeat_due: false,
        };
        engine.events.push_back(Event::ConnectionInit);
        if side.is_client() {
            engine.local_open = true;
            engine.events.push_back(Event::ConnectionLocalOpen);
        }
        engine
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn container_id(&self) -> &str {
        &self.container_id
    }

    pub(crate) fn remote_container_id(&self) -> Option<&str> {
        self.remote_container_id.as_deref()
    }

    pub(crate) fn remote_idle_timeout(&self) -> Option<Duration> {
        self.remote_idle_timeout
    }

    pub(crate) fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub(crate) fn is_transport_closed(&self) -> bool {
        self.transport_closed
    }

    pub(crate) fn is_unbound(&self) -> bool {
        self.unbound
    }

    pub(crate) fn transport_condition(&self) -> Option<&ErrorCondition> {
        self.condition.as_ref()
    }

    pub(crate) fn remote_close_condition(&self) -> Option<&ErrorCondition> {
        self.remote_close_condition.as_ref()
    }

    /// Room left in the input buffer; inbound chunks are sized to this
    pub(crate) fn input_capacity(&self) -> usize {
        (self.max_frame_size as usize)
            .saturating_sub(self.input.len())
            .max(frame::FRAME_HEADER_LEN)
    }

    // Input pump

    pub(crate) fn process_input(&mut self, now: Instant, bytes: &[u8]) -> Result<(), EngineError> {
        if self.tail_closed {
            trace!("discarding {} bytes past tail close", bytes.len());
            return Ok(());
        }
        self.last_input = Some(now);
        self.input.extend_from_slice(bytes);
        loop {
            if !self.sasl.is_done() {
                if !self.sasl.header_received() {
                    if self.input.len() < frame::FRAME_HEADER_LEN {
                        return Ok(());
                    }
                    let header = self.input.split_to(frame::FRAME_HEADER_LEN);
                    self.sasl.receive_header(&header)?;
                    continue;
                }
                match frame::try_frame(&mut self.input, self.max_frame_size)? {
                    None => return Ok(()),
                    Some(raw) => {
                        if raw.ty != FRAME_TYPE_SASL {
                            return Err(EngineError::Protocol("amqp frame during sasl exchange"));
                        }
                        if raw.body.is_empty() {
                            continue;
                        }
                        let body = frame::parse_sasl(raw.body)?;
                        self.sasl.handle(body)?;
                        continue;
                    }
                }
            }
            if !self.amqp_header_received {
                if self.input.len() < frame::FRAME_HEADER_LEN {
                    return Ok(());
                }
                let header = self.input.split_to(frame::FRAME_HEADER_LEN);
                if header[..] != frame::AMQP_HEADER[..] {
                    return Err(EngineError::Protocol("bad amqp protocol header"));
                }
                self.amqp_header_received = true;
                continue;
            }
            match frame::try_frame(&mut self.input, self.max_frame_size)? {
                None => return Ok(()),
                Some(raw) => self.handle_frame(now, raw)?,
            }
        }
    }

    fn handle_frame(&mut self, now: Instant, raw: RawFrame) -> Result<(), EngineError> {
        if raw.ty != FRAME_TYPE_AMQP {
            return Err(EngineError::Protocol("sasl frame after negotiation"));
        }
        if raw.body.is_empty() {
            trace!("heartbeat received");
            return Ok(());
        }
        let (performative, payload) = frame::parse_performative(raw.body)?;
        trace!(?performative, payload = payload.len(), "frame received");
        match performative {
            Performative::Open(open) => self.on_open(now, open),
            Performative::Begin(begin) => self.on_begin(raw.channel, begin),
            Performative::Attach(attach) => self.on_attach(attach),
            Performative::Flow(flow) => self.on_flow(flow),
            Performative::Transfer(transfer) => self.on_transfer(transfer, payload),
            Performative::Disposition(disposition) => self.on_disposition(disposition),
            Performative::Detach(detach) => self.on_detach(detach),
            Performative::End(end) => self.on_end(end),
            Performative::Close(close) => self.on_close(close),
        }
    }

    fn on_open(&mut self, now: Instant, open: Open) -> Result<(), EngineError> {
        if self.remote_open {
            return Err(EngineError::Protocol("duplicate open"));
        }
        self.remote_open = true;
        self.remote_max_frame_size = open.max_frame_size.max(MIN_MAX_FRAME_SIZE);
        self.remote_idle_timeout = open
            .idle_timeout
            .filter(|&ms| ms > 0)
            .map(|ms| Duration::from_millis(ms.into()));
        if let Some(idle) = self.remote_idle_timeout {
            self.next_heartbeat = Some(now + idle / 2);
        }
        debug!(container = %open.container_id, "remote opened");
        self.remote_container_id = Some(open.container_id);
        self.events.push_back(Event::ConnectionRemoteOpen);
        if self.side.is_server() && !self.local_open {
            self.local_open = true;
            self.events.push_back(Event::ConnectionLocalOpen);
        }
        Ok(())
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<(), EngineError> {
        match self.session {
            Some(ref mut s) if s.remote_channel.is_none() && !s.remote_open => {
                s.remote_open = true;
                s.remote_channel = Some(channel);
                let id = s.id;
                self.next_incoming_transfer_id = begin.next_outgoing_id;
                self.events.push_back(Event::SessionRemoteOpen(id));
                Ok(())
            }
            Some(_) => Err(EngineError::Protocol("unexpected second begin")),
            None => {
                let id = SessionId(self.next_session_id);
                self.next_session_id += 1;
                self.session = Some(SessionEp {
                    id,
                    local_open: false,
                    begin_sent: false,
                    remote_open: true,
                    remote_channel: Some(channel),
                    local_close: false,
                    end_sent: false,
                    remote_close: false,
                });
                self.next_incoming_transfer_id = begin.next_outgoing_id;
                self.events.push_back(Event::SessionInit(id));
                self.events.push_back(Event::SessionRemoteOpen(id));
                Ok(())
            }
        }
    }

    fn on_attach(&mut self, attach: Attach) -> Result<(), EngineError> {
        // a response to one of our attaches marries by link name
        if let Some(link) = self
            .links
            .values_mut()
            .find(|l| l.remote_handle.is_none() && !l.remote_close && l.name == attach.name)
        {
            link.remote_handle = Some(attach.handle);
            link.remote_open = true;
            if attach.target.as_ref().map_or(false, |t| t.coordinator) {
                link.coordinator = true;
            }
            if link.role == Role::Sender {
                // peers may start us with credit in the attach exchange; a
                // flow normally follows, so nothing to do here
                link.remote_delivery_count = attach.initial_delivery_count.unwrap_or(0);
            }
            let id = link.id;
            self.by_remote_handle.insert(attach.handle, id);
            self.events.push_back(Event::LinkRemoteOpen(id));
            return Ok(());
        }

        // remotely-initiated link: adopt the opposite role and attach back
        let role = match attach.role {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        };
        let coordinator = attach.target.as_ref().map_or(false, |t| t.coordinator);
        let address = match role {
            Role::Receiver => attach
                .target
                .as_ref()
                .and_then(|t| t.address.clone())
                .or_else(|| attach.source.as_ref().and_then(|s| s.address.clone())),
            Role::Sender => attach
                .source
                .as_ref()
                .and_then(|s| s.address.clone())
                .or_else(|| attach.target.as_ref().and_then(|t| t.address.clone())),
        };
        let refused = role == Role::Receiver && address.is_none() && !coordinator;
        if refused {
            warn!(name = %attach.name, "refusing attach without a terminus address");
        }

        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        let local_handle = self.next_local_handle;
        self.next_local_handle += 1;
        let window = if role == Role::Receiver && !refused {
            self.link_credit_window
        } else {
            0
        };
        let source = attach.source.clone().unwrap_or(Source {
            address: None,
            durable: TerminusDurability::None,
            dynamic: false,
        });
        let target = attach.target.clone().unwrap_or(Target {
            address: None,
            durable: TerminusDurability::None,
            dynamic: false,
            coordinator: false,
        });
        let link = LinkEp {
            id,
            name: attach.name,
            role,
            address,
            coordinator,
            local_handle,
            remote_handle: Some(attach.handle),
            source,
            target,
            local_open: true,
            attach_sent: false,
            remote_open: true,
            local_close: refused,
            detach_sent: false,
            detach_error: refused.then(|| {
                ErrorCondition::new("amqp:invalid-field", "attach carries no terminus address")
            }),
            remote_close: false,
            remote_condition: None,
            credit: 0,
            delivery_count: 0,
            window,
            remote_delivery_count: attach.initial_delivery_count.unwrap_or(0),
            settled_since_flow: 0,
            flow_due: window > 0,
            current_incoming: None,
        };
        self.by_remote_handle.insert(attach.handle, id);
        self.links.insert(id, link);
        if !refused {
            self.events.push_back(Event::LinkRemoteOpen(id));
            self.events.push_back(Event::LinkLocalOpen(id));
        }
        Ok(())
    }

    fn on_flow(&mut self, flow: Flow) -> Result<(), EngineError> {
        let Some(handle) = flow.handle else {
            trace!("session-level flow");
            return Ok(());
        };
        let Some(&id) = self.by_remote_handle.get(&handle) else {
            trace!(handle, "flow for unknown link");
            return Ok(());
        };
        let link = self.links.get_mut(&id).expect("handle map out of sync");
        if link.role == Role::Sender {
            let delivery_count = flow.delivery_count.unwrap_or(0);
            link.credit = delivery_count
                .wrapping_add(flow.link_credit.unwrap_or(0))
                .wrapping_sub(link.delivery_count);
            trace!(link = ?id, credit = link.credit, "sender credit updated");
            self.events.push_back(Event::LinkFlow(id));
        } else {
            trace!(link = ?id, "flow on receiver link");
        }
        Ok(())
    }

    fn on_transfer(&mut self, transfer: Transfer, payload: Bytes) -> Result<(), EngineError> {
        let Some(&id) = self.by_remote_handle.get(&transfer.handle) else {
            trace!(handle = transfer.handle, "transfer for unknown link");
            return Ok(());
        };
        self.next_incoming_transfer_id = self.next_incoming_transfer_id.wrapping_add(1);
        let link = self.links.get_mut(&id).expect("handle map out of sync");
        if link.role == Role::Sender {
            return Err(EngineError::Protocol("transfer on a sender link"));
        }
        match link.current_incoming {
            Some(did) => {
                let delivery = self
                    .deliveries
                    .get_mut(&did)
                    .expect("current delivery missing");
                delivery.payload.extend_from_slice(&payload);
                delivery.partial = transfer.more;
                if !transfer.more {
                    link.current_incoming = None;
                }
                self.events.push_back(Event::Delivery(did));
            }
            None => {
                let wire_id = transfer
                    .delivery_id
                    .ok_or(EngineError::Protocol("first transfer without delivery-id"))?;
                let did = DeliveryId(self.next_delivery);
                self.next_delivery += 1;
                link.remote_delivery_count = link.remote_delivery_count.wrapping_add(1);
                if transfer.more {
                    link.current_incoming = Some(did);
                }
                self.deliveries.insert(
                    did,
                    DeliveryEp {
                        link: id,
                        wire_id,
                        incoming: true,
                        payload: BytesMut::from(&payload[..]),
                        partial: transfer.more,
                        remotely_settled: transfer.settled.unwrap_or(false),
                        remote_state: None,
                    },
                );
                self.events.push_back(Event::Delivery(did));
            }
        }
        Ok(())
    }

    fn on_disposition(&mut self, disposition: Disposition) -> Result<(), EngineError> {
        if disposition.role != Role::Receiver {
            trace!("ignoring sender-role disposition");
            return Ok(());
        }
        let last = disposition.last.unwrap_or(disposition.first);
        if last < disposition.first {
            return Err(EngineError::Protocol("disposition range inverted"));
        }
        for wire_id in disposition.first..=last {
            let Some(&did) = self.out_by_wire_id.get(&wire_id) else {
                continue;
            };
            let delivery = self.deliveries.get_mut(&did).expect("wire map out of sync");
            delivery.remotely_settled = disposition.settled;
            delivery.remote_state = disposition.state.clone();
            self.events.push_back(Event::Delivery(did));
        }
        Ok(())
    }

    fn on_detach(&mut self, detach: Detach) -> Result<(), EngineError> {
        let Some(&id) = self.by_remote_handle.get(&detach.handle) else {
            trace!(handle = detach.handle, "detach for unknown link");
            return Ok(());
        };
        let link = self.links.get_mut(&id).expect("handle map out of sync");
        link.remote_close = true;
        link.remote_condition = detach.error;
        self.events.push_back(Event::LinkRemoteClose(id));
        if !link.local_close {
            link.local_close = true;
        } else if link.detach_sent {
            self.finalize_link(id);
        }
        Ok(())
    }

    fn on_end(&mut self, _end: End) -> Result<(), EngineError> {
        let Some(ref mut s) = self.session else {
            trace!("end without a session");
            return Ok(());
        };
        s.remote_close = true;
        let id = s.id;
        self.events.push_back(Event::SessionRemoteClose(id));
        let already_ended = s.local_close;
        if !already_ended {
            s.local_close = true;
            self.events.push_back(Event::SessionLocalClose(id));
        } else if s.end_sent {
            self.finalize_session();
        }
        Ok(())
    }

    fn on_close(&mut self, close: Close) -> Result<(), EngineError> {
        self.remote_close = true;
        if let Some(ref error) = close.error {
            warn!(condition = %error, "remote closed with error");
        }
        self.remote_close_condition = close.error;
        self.events.push_back(Event::ConnectionRemoteClose);
        if !self.local_close {
            self.local_close = true;
            self.events.push_back(Event::ConnectionLocalClose);
        }
        Ok(())
    }

    // Output generation

    /// Derive all due frames from endpoint state and append them to the
    /// output buffer. Idempotent between state changes.
    pub(crate) fn generate(&mut self) {
        if self.head_closed {
            return;
        }
        let before = self.out.len();
        self.sasl.output(&mut self.out);
        if self.sasl.is_done() {
            self.generate_amqp();
        }
        if self.out.len() > before {
            self.events.push_back(Event::Transport);
        }
        if self.close_sent && self.remote_close && !self.tail_closed {
            // orderly shutdown: both closes on the wire, tear the pipe down
            self.close_tail();
            self.close_head();
        }
    }

    fn generate_amqp(&mut self) {
        if !self.amqp_header_sent {
            self.out.extend_from_slice(&frame::AMQP_HEADER);
            self.amqp_header_sent = true;
        }
        if self.local_open && !self.open_sent {
            let open = Open {
                container_id: self.container_id.clone(),
                hostname: None,
                max_frame_size: self.max_frame_size,
                channel_max: u8::MAX as u16,
                idle_timeout: Some(self.idle_timeout.as_millis() as u32),
            };
            frame::encode_frame(&mut self.out, CHANNEL, &Performative::Open(open), &[]);
            self.open_sent = true;
        }
        if !self.open_sent {
            return;
        }

        if let Some(ref mut s) = self.session {
            if s.local_open && !s.begin_sent {
                let begin = Begin {
                    remote_channel: s.remote_channel,
                    next_outgoing_id: self.next_outgoing_transfer_id,
                    incoming_window: SESSION_WINDOW,
                    outgoing_window: SESSION_WINDOW,
                    handle_max: u32::MAX,
                };
                frame::encode_frame(&mut self.out, CHANNEL, &Performative::Begin(begin), &[]);
                s.begin_sent = true;
            }
        }
        let session_begun = self.session.as_ref().map_or(false, |s| s.begin_sent);
        if session_begun {
            self.generate_links();
        }

        if self.local_close && self.open_sent && !self.close_sent {
            let close = Close {
                error: self.close_condition.take(),
            };
            frame::encode_frame(&mut self.out, CHANNEL, &Performative::Close(close), &[]);
            self.close_sent = true;
        }

        if self.heartbeat_due && !self.close_sent {
            frame::encode_heartbeat(&mut self.out);
            self.heartbeat_due = false;
        }
    }

    fn generate_links(&mut self) {
        for link in self.links.values_mut() {
            if link.local_open && !link.attach_sent {
                let attach = Attach {
                    name: link.name.clone(),
                    handle: link.local_handle,
                    role: link.role,
                    snd_settle_mode: SenderSettleMode::Unsettled,
                    rcv_settle_mode: ReceiverSettleMode::First,
                    source: Some(link.source.clone()),
                    target: Some(link.target.clone()),
                    initial_delivery_count: link.role.is_sender().then_some(link.delivery_count),
                };
                frame::encode_frame(&mut self.out, CHANNEL, &Performative::Attach(attach), &[]);
                link.attach_sent = true;
            }
        }

        let next_incoming = self.next_incoming_transfer_id;
        let next_outgoing = self.next_outgoing_transfer_id;
        for link in self.links.values_mut() {
            if link.flow_due && link.attach_sent && !link.local_close {
                let flow = Flow {
                    next_incoming_id: Some(next_incoming),
                    incoming_window: SESSION_WINDOW,
                    next_outgoing_id: next_outgoing,
                    outgoing_window: SESSION_WINDOW,
                    handle: Some(link.local_handle),
                    delivery_count: Some(link.remote_delivery_count),
                    link_credit: Some(link.window),
                };
                frame::encode_frame(&mut self.out, CHANNEL, &Performative::Flow(flow), &[]);
                link.flow_due = false;
            }
        }

        while let Some(pending) = self.pending_transfers.front() {
            let Some(link) = self.links.get(&pending.link) else {
                // link torn down with the transfer still queued; the message
                // record is completed by connection-final cleanup
                self.pending_transfers.pop_front();
                continue;
            };
            if !link.attach_sent {
                break;
            }
            let pending = self.pending_transfers.pop_front().expect("front checked");
            let chunk_max = (self.remote_max_frame_size as usize)
                .saturating_sub(TRANSFER_OVERHEAD)
                .max(MIN_MAX_FRAME_SIZE as usize / 2);
            let handle = link.local_handle;
            let total = pending.payload.len();
            let mut offset = 0;
            let mut first = true;
            loop {
                let end = (offset + chunk_max).min(total);
                let more = end < total;
                let transfer = Transfer {
                    handle,
                    delivery_id: Some(pending.wire_delivery_id),
                    delivery_tag: first.then(|| pending.tag.clone()),
                    settled: Some(false),
                    more,
                };
                frame::encode_frame(
                    &mut self.out,
                    CHANNEL,
                    &Performative::Transfer(transfer),
                    &pending.payload[offset..end],
                );
                self.next_outgoing_transfer_id = self.next_outgoing_transfer_id.wrapping_add(1);
                first = false;
                offset = end;
                if !more {
                    break;
                }
            }
        }

        for disposition in self.pending_dispositions.drain(..) {
            frame::encode_frame(
                &mut self.out,
                CHANNEL,
                &Performative::Disposition(disposition),
                &[],
            );
        }

        let mut finals = Vec::new();
        for link in self.links.values_mut() {
            if link.local_close && link.attach_sent && !link.detach_sent {
                let detach = Detach {
                    handle: link.local_handle,
                    closed: true,
                    error: link.detach_error.take(),
                };
                frame::encode_frame(&mut self.out, CHANNEL, &Performative::Detach(detach), &[]);
                link.detach_sent = true;
            }
            if link.detach_sent && link.remote_close {
                finals.push(link.id);
            }
        }
        for id in finals {
            self.finalize_link(id);
        }

        let mut session_done = false;
        if let Some(ref mut s) = self.session {
            if s.local_close && s.begin_sent && !s.end_sent {
                let end = End { error: None };
                frame::encode_frame(&mut self.out, CHANNEL, &Performative::End(end), &[]);
                s.end_sent = true;
            }
            session_done = s.end_sent && s.remote_close;
        }
        if session_done {
            self.finalize_session();
        }
    }

    /// Drain the accumulated output, if any
    pub(crate) fn take_output(&mut self) -> Option<Bytes> {
        if self.out.is_empty() {
            return None;
        }
        Some(self.out.split().freeze())
    }

    // Operations invoked by the state machine

    /// Open the single logical session, adopting a remotely-begun one when
    /// the peer got there first
    pub(crate) fn session_open(&mut self) -> SessionId {
        match self.session {
            Some(ref mut s) if !s.local_open => {
                s.local_open = true;
                let id = s.id;
                self.events.push_back(Event::SessionLocalOpen(id));
                id
            }
            Some(ref s) => s.id,
            None => {
                let id = SessionId(self.next_session_id);
                self.next_session_id += 1;
                self.session = Some(SessionEp {
                    id,
                    local_open: true,
                    begin_sent: false,
                    remote_open: false,
                    remote_channel: None,
                    local_close: false,
                    end_sent: false,
                    remote_close: false,
                });
                self.events.push_back(Event::SessionInit(id));
                self.events.push_back(Event::SessionLocalOpen(id));
                id
            }
        }
    }

    /// Open a sending link for `address` on the session
    pub(crate) fn sender_open(&mut self, name: &str, address: &str) -> LinkId {
        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        let local_handle = self.next_local_handle;
        self.next_local_handle += 1;
        let link = LinkEp {
            id,
            name: name.to_owned(),
            role: Role::Sender,
            address: Some(address.to_owned()),
            coordinator: false,
            local_handle,
            remote_handle: None,
            source: Source {
                address: Some(address.to_owned()),
                durable: TerminusDurability::None,
                dynamic: false,
            },
            target: Target {
                address: Some(address.to_owned()),
                durable: TerminusDurability::UnsettledState,
                dynamic: false,
                coordinator: false,
            },
            local_open: true,
            attach_sent: false,
            remote_open: false,
            local_close: false,
            detach_sent: false,
            detach_error: None,
            remote_close: false,
            remote_condition: None,
            credit: 0,
            delivery_count: 0,
            window: 0,
            remote_delivery_count: 0,
            settled_since_flow: 0,
            flow_due: false,
            current_incoming: None,
        };
        self.links.insert(id, link);
        self.events.push_back(Event::LinkLocalOpen(id));
        id
    }

    pub(crate) fn link_role(&self, id: LinkId) -> Option<Role> {
        self.links.get(&id).map(|l| l.role)
    }

    pub(crate) fn link_address(&self, id: LinkId) -> Option<&str> {
        self.links.get(&id)?.address.as_deref()
    }

    pub(crate) fn link_is_coordinator(&self, id: LinkId) -> bool {
        self.links.get(&id).map_or(false, |l| l.coordinator)
    }

    pub(crate) fn link_remote_condition(&self, id: LinkId) -> Option<&ErrorCondition> {
        self.links.get(&id)?.remote_condition.as_ref()
    }

    pub(crate) fn sender_credit(&self, id: LinkId) -> u32 {
        self.links
            .get(&id)
            .filter(|l| l.role.is_sender() && l.remote_open && !l.local_close && !l.remote_close)
            .map_or(0, |l| l.credit)
    }

    /// Create a delivery and queue its transfer. Consumes one credit.
    pub(crate) fn send(&mut self, id: LinkId, tag: [u8; 4], payload: Bytes) -> Option<DeliveryId> {
        let link = self.links.get_mut(&id)?;
        if !link.role.is_sender() || link.credit == 0 {
            return None;
        }
        link.credit -= 1;
        link.delivery_count = link.delivery_count.wrapping_add(1);
        let wire_id = self.next_outgoing_delivery_id;
        self.next_outgoing_delivery_id = self.next_outgoing_delivery_id.wrapping_add(1);
        let did = DeliveryId(self.next_delivery);
        self.next_delivery += 1;
        self.deliveries.insert(
            did,
            DeliveryEp {
                link: id,
                wire_id,
                incoming: false,
                payload: BytesMut::new(),
                partial: false,
                remotely_settled: false,
                remote_state: None,
            },
        );
        self.out_by_wire_id.insert(wire_id, did);
        self.pending_transfers.push_back(PendingTransfer {
            link: id,
            wire_delivery_id: wire_id,
            tag: Bytes::copy_from_slice(&tag),
            payload,
        });
        Some(did)
    }

    pub(crate) fn delivery_link(&self, id: DeliveryId) -> Option<LinkId> {
        self.deliveries.get(&id).map(|d| d.link)
    }

    pub(crate) fn delivery_is_incoming(&self, id: DeliveryId) -> bool {
        self.deliveries.get(&id).map_or(false, |d| d.incoming)
    }

    pub(crate) fn delivery_readable(&self, id: DeliveryId) -> bool {
        self.deliveries
            .get(&id)
            .map_or(false, |d| d.incoming && !d.payload.is_empty())
    }

    pub(crate) fn delivery_partial(&self, id: DeliveryId) -> bool {
        self.deliveries.get(&id).map_or(false, |d| d.partial)
    }

    pub(crate) fn delivery_remotely_settled(&self, id: DeliveryId) -> bool {
        self.deliveries.get(&id).map_or(false, |d| d.remotely_settled)
    }

    pub(crate) fn delivery_remote_accepted(&self, id: DeliveryId) -> bool {
        self.deliveries
            .get(&id)
            .and_then(|d| d.remote_state.as_ref())
            .map_or(false, DeliveryState::is_accepted)
    }

    /// Take an inbound delivery's accumulated bytes; the delivery itself
    /// stays open for later settlement
    pub(crate) fn recv(&mut self, id: DeliveryId) -> Option<Bytes> {
        let delivery = self.deliveries.get_mut(&id)?;
        if !delivery.incoming {
            return None;
        }
        Some(delivery.payload.split().freeze())
    }

    /// Move past the current inbound delivery if `id` still is it
    pub(crate) fn receiver_advance(&mut self, link: LinkId, id: DeliveryId) {
        if let Some(l) = self.links.get_mut(&link) {
            if l.current_incoming == Some(id) {
                l.current_incoming = None;
            }
        }
    }

    /// Settle an inbound delivery with an accepted or rejected outcome,
    /// topping the credit window back up when half of it has been consumed
    pub(crate) fn disposition(&mut self, id: DeliveryId, accepted: bool) {
        let Some(delivery) = self.deliveries.remove(&id) else {
            trace!(delivery = ?id, "disposition for unknown delivery");
            return;
        };
        if !delivery.incoming {
            return;
        }
        let state = if accepted {
            DeliveryState::Accepted
        } else {
            DeliveryState::Rejected(None)
        };
        self.pending_dispositions.push(Disposition {
            role: Role::Receiver,
            first: delivery.wire_id,
            last: None,
            settled: true,
            state: Some(state),
        });
        if let Some(link) = self.links.get_mut(&delivery.link) {
            if link.current_incoming == Some(id) {
                link.current_incoming = None;
            }
            link.settled_since_flow += 1;
            if link.window > 0 && link.settled_since_flow * 2 >= link.window {
                link.settled_since_flow = 0;
                link.flow_due = true;
            }
        }
    }

    /// Locally settle an outbound delivery once the remote has disposed it
    pub(crate) fn settle(&mut self, id: DeliveryId) {
        if let Some(delivery) = self.deliveries.remove(&id) {
            self.out_by_wire_id.remove(&delivery.wire_id);
        }
    }

    /// Close the connection locally, optionally carrying an error condition
    pub(crate) fn close(&mut self, condition: Option<ErrorCondition>) {
        if self.local_close {
            return;
        }
        self.local_close = true;
        self.close_condition = condition;
        self.events.push_back(Event::ConnectionLocalClose);
    }

    /// Fail the transport: record the condition and force the head/tail
    /// close cycle, discarding undelivered output
    pub(crate) fn abort(&mut self, condition: ErrorCondition) {
        if self.transport_closed {
            return;
        }
        warn!(condition = %condition, "transport failed");
        self.condition = Some(condition);
        self.events.push_back(Event::TransportError);
        self.close_tail();
        self.out.clear();
        self.close_head();
    }

    pub(crate) fn close_tail(&mut self) {
        if self.tail_closed {
            return;
        }
        self.tail_closed = true;
        self.input.clear();
        self.events.push_back(Event::TransportTailClosed);
        self.check_transport_closed();
    }

    pub(crate) fn close_head(&mut self) {
        if self.head_closed {
            return;
        }
        self.head_closed = true;
        self.events.push_back(Event::TransportHeadClosed);
        self.check_transport_closed();
    }

    /// Force the transport shut without a condition, covering teardown
    /// paths where no transport-closed event would otherwise surface
    pub(crate) fn force_transport_close(&mut self) {
        self.close_tail();
        self.close_head();
    }

    fn check_transport_closed(&mut self) {
        if self.tail_closed && self.head_closed && !self.transport_closed {
            self.transport_closed = true;
            self.events.push_back(Event::TransportClosed);
        }
    }

    /// Unbind and free every endpoint, finishing with connection-final
    pub(crate) fn unbind(&mut self) {
        if self.unbound {
            return;
        }
        self.unbound = true;
        self.events.push_back(Event::ConnectionUnbound);
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in ids {
            self.finalize_link(id);
        }
        if let Some(s) = self.session.take() {
            self.events.push_back(Event::SessionFinal(s.id));
        }
        self.deliveries.clear();
        self.out_by_wire_id.clear();
        self.pending_transfers.clear();
        self.pending_dispositions.clear();
        if !self.finalized {
            self.finalized = true;
            self.events.push_back(Event::ConnectionFinal);
        }
    }

    fn finalize_link(&mut self, id: LinkId) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        if let Some(handle) = link.remote_handle {
            self.by_remote_handle.remove(&handle);
        }
        let dropped: Vec<DeliveryId> = self
            .deliveries
            .iter()
            .filter(|(_, d)| d.link == id)
            .map(|(&did, _)| did)
            .collect();
        for did in dropped {
            if let Some(d) = self.deliveries.remove(&did) {
                if !d.incoming {
                    self.out_by_wire_id.remove(&d.wire_id);
                }
            }
        }
        self.events.push_back(Event::LinkFinal {
            link: id,
            role: link.role,
            address: link.address,
        });
    }

    fn finalize_session(&mut self) {
        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in ids {
            self.finalize_link(id);
        }
        if let Some(s) = self.session.take() {
            self.events.push_back(Event::SessionFinal(s.id));
        }
    }

    // Time

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        if self.transport_closed {
            return None;
        }
        let idle = (!self.idle_timeout.is_zero())
            .then_some(())
            .and(self.last_input)
            .map(|t| t + self.idle_timeout);
        match (idle, self.next_heartbeat) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        if self.transport_closed {
            return;
        }
        if !self.idle_timeout.is_zero() {
            if let Some(last) = self.last_input {
                if now.saturating_duration_since(last) >= self.idle_timeout {
                    self.abort(ErrorCondition::new(
                        "amqp:resource-limit-exceeded",
                        "local idle timeout expired",
                    ));
                    return;
                }
            }
        }
        if let Some(idle) = self.remote_idle_timeout {
            if let Some(due) = self.next_heartbeat {
                if now >= due {
                    self.heartbeat_due = true;
                    self.next_heartbeat = Some(now + idle / 2);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Engine, Engine) {
        let client = Engine::new(
            Side::Client,
            SaslConfig::Anonymous,
            131_072,
            Duration::from_secs(10),
            8,
        );
        let server = Engine::new(
            Side::Server,
            SaslConfig::Anonymous,
            131_072,
            Duration::from_secs(10),
            8,
        );
        (client, server)
    }

    fn shuttle(now: Instant, from: &mut Engine, to: &mut Engine) -> bool {
        from.generate();
        match from.take_output() {
            Some(bytes) => {
                to.process_input(now, &bytes).unwrap();
                true
            }
            None => false,
        }
    }

    fn drive(now: Instant, a: &mut Engine, b: &mut Engine) {
        loop {
            let moved = shuttle(now, a, b);
            let moved = shuttle(now, b, a) || moved;
            a.events.clear();
            b.events.clear();
            if !moved {
                break;
            }
        }
    }

    #[test]
    fn handshake_reaches_open_on_both_sides() {
        let now = Instant::now();
        let (mut client, mut server) = pair();
        drive(now, &mut client, &mut server);
        assert!(client.remote_open);
        assert!(server.remote_open);
        assert!(server.local_open);
        assert!(client.remote_container_id().unwrap().starts_with("CORDA:"));
        assert!(server.remote_container_id().unwrap().starts_with("CORDA:"));
    }

    #[test]
    fn idle_timeout_aborts_the_transport() {
        let now = Instant::now();
        let (mut client, mut server) = pair();
        drive(now, &mut client, &mut server);
        client.handle_timeout(now + Duration::from_secs(11));
        assert!(client.is_transport_closed());
        assert_eq!(
            client.transport_condition().unwrap().condition,
            "amqp:resource-limit-exceeded"
        );
    }

    #[test]
    fn heartbeats_fire_at_half_the_remote_window() {
        let now = Instant::now();
        let (mut client, mut server) = pair();
        drive(now, &mut client, &mut server);
        let due = client.poll_timeout().unwrap();
        assert!(due <= now + Duration::from_secs(5));
        client.handle_timeout(due);
        client.generate();
        let bytes = client.take_output().unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 8, 2, 0, 0, 0]);
        // the empty frame counts as peer activity on the other side
        server.process_input(due, &bytes).unwrap();
        assert_eq!(server.last_input, Some(due));
    }
}
