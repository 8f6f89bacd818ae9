//! AMQP 1.0 frame and performative codec.
//!
//! Frames are length-prefixed: a four-byte size (including the eight-byte
//! header), a data offset, a frame type (0 = AMQP, 1 = SASL), and a channel
//! number, followed by one described-list performative and an optional
//! payload. Only the performatives this link exchanges are representable;
//! fields beyond the ones consumed are skipped on decode and truncated
//! field lists fall back to AMQP defaults.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{self, ParseError, FC_NULL};

pub(crate) const AMQP_HEADER: [u8; 8] = *b"AMQP\x00\x01\x00\x00";
pub(crate) const SASL_HEADER: [u8; 8] = *b"AMQP\x03\x01\x00\x00";

pub(crate) const FRAME_HEADER_LEN: usize = 8;

pub(crate) const FRAME_TYPE_AMQP: u8 = 0x00;
pub(crate) const FRAME_TYPE_SASL: u8 = 0x01;

// Performative and section descriptor codes
pub(crate) const DESC_OPEN: u64 = 0x10;
pub(crate) const DESC_BEGIN: u64 = 0x11;
pub(crate) const DESC_ATTACH: u64 = 0x12;
pub(crate) const DESC_FLOW: u64 = 0x13;
pub(crate) const DESC_TRANSFER: u64 = 0x14;
pub(crate) const DESC_DISPOSITION: u64 = 0x15;
pub(crate) const DESC_DETACH: u64 = 0x16;
pub(crate) const DESC_END: u64 = 0x17;
pub(crate) const DESC_CLOSE: u64 = 0x18;
pub(crate) const DESC_ERROR: u64 = 0x1d;
pub(crate) const DESC_RECEIVED: u64 = 0x23;
pub(crate) const DESC_ACCEPTED: u64 = 0x24;
pub(crate) const DESC_REJECTED: u64 = 0x25;
pub(crate) const DESC_RELEASED: u64 = 0x26;
pub(crate) const DESC_MODIFIED: u64 = 0x27;
pub(crate) const DESC_SOURCE: u64 = 0x28;
pub(crate) const DESC_TARGET: u64 = 0x29;
pub(crate) const DESC_COORDINATOR: u64 = 0x30;
pub(crate) const DESC_SASL_MECHANISMS: u64 = 0x40;
pub(crate) const DESC_SASL_INIT: u64 = 0x41;
pub(crate) const DESC_SASL_CHALLENGE: u64 = 0x42;
pub(crate) const DESC_SASL_RESPONSE: u64 = 0x43;
pub(crate) const DESC_SASL_OUTCOME: u64 = 0x44;

/// Which end of a link a peer occupies. On the wire: sender = false.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub(crate) fn is_sender(self) -> bool {
        self == Role::Sender
    }

    fn wire(self) -> bool {
        self == Role::Receiver
    }

    fn from_wire(v: bool) -> Self {
        if v {
            Role::Receiver
        } else {
            Role::Sender
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SenderSettleMode {
    Unsettled = 0,
    Settled = 1,
    Mixed = 2,
}

impl SenderSettleMode {
    fn from_wire(v: u8) -> Result<Self, ParseError> {
        Ok(match v {
            0 => SenderSettleMode::Unsettled,
            1 => SenderSettleMode::Settled,
            2 => SenderSettleMode::Mixed,
            _ => return Err(ParseError::Malformed("sender settle mode")),
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ReceiverSettleMode {
    First = 0,
    Second = 1,
}

impl ReceiverSettleMode {
    fn from_wire(v: u8) -> Result<Self, ParseError> {
        Ok(match v {
            0 => ReceiverSettleMode::First,
            1 => ReceiverSettleMode::Second,
            _ => return Err(ParseError::Malformed("receiver settle mode")),
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TerminusDurability {
    None = 0,
    Configuration = 1,
    UnsettledState = 2,
}

impl TerminusDurability {
    fn from_wire(v: u32) -> Result<Self, ParseError> {
        Ok(match v {
            0 => TerminusDurability::None,
            1 => TerminusDurability::Configuration,
            2 => TerminusDurability::UnsettledState,
            _ => return Err(ParseError::Malformed("terminus durability")),
        })
    }
}

/// An AMQP error condition, as carried by detach/end/close performatives
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct ErrorCondition {
    pub condition: String,
    pub description: Option<String>,
}

impl ErrorCondition {
    pub(crate) fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_ERROR);
        let mut fields = BytesMut::new();
        types::put_symbol(&mut fields, &self.condition);
        match self.description {
            Some(ref d) => types::put_string(&mut fields, d),
            None => types::put_null(&mut fields),
        }
        types::put_list(out, 2, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        let condition = fields
            .opt_symbol()?
            .ok_or(ParseError::Malformed("error without condition"))?;
        let description = fields.opt_string()?;
        Ok(Self {
            condition,
            description,
        })
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.description {
            Some(ref d) => write!(f, "{} ({})", self.condition, d),
            None => f.write_str(&self.condition),
        }
    }
}

/// Terminal disposition of a delivery
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum DeliveryState {
    Received,
    Accepted,
    Rejected(Option<ErrorCondition>),
    Released,
    Modified,
}

impl DeliveryState {
    pub(crate) fn is_accepted(&self) -> bool {
        matches!(*self, DeliveryState::Accepted)
    }

    fn encode(&self, out: &mut BytesMut) {
        match *self {
            DeliveryState::Accepted => {
                types::put_descriptor(out, DESC_ACCEPTED);
                types::put_list(out, 0, &[]);
            }
            DeliveryState::Released => {
                types::put_descriptor(out, DESC_RELEASED);
                types::put_list(out, 0, &[]);
            }
            DeliveryState::Rejected(ref error) => {
                types::put_descriptor(out, DESC_REJECTED);
                match *error {
                    Some(ref e) => {
                        let mut fields = BytesMut::new();
                        e.encode(&mut fields);
                        types::put_list(out, 1, &fields);
                    }
                    None => types::put_list(out, 0, &[]),
                }
            }
            // only ever produced by peers
            DeliveryState::Received | DeliveryState::Modified => {
                types::put_descriptor(out, DESC_RECEIVED);
                types::put_list(out, 0, &[]);
            }
        }
    }

    fn decode(code: u64, fields: &mut FieldReader) -> Result<Self, ParseError> {
        Ok(match code {
            DESC_RECEIVED => DeliveryState::Received,
            DESC_ACCEPTED => DeliveryState::Accepted,
            DESC_REJECTED => DeliveryState::Rejected(fields.opt_error()?),
            DESC_RELEASED => DeliveryState::Released,
            DESC_MODIFIED => DeliveryState::Modified,
            other => return Err(ParseError::UnknownDescriptor(other)),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Source {
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub dynamic: bool,
}

impl Source {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_SOURCE);
        let mut fields = BytesMut::new();
        match self.address {
            Some(ref a) => types::put_string(&mut fields, a),
            None => types::put_null(&mut fields),
        }
        types::put_uint(&mut fields, self.durable as u32);
        types::put_null(&mut fields); // expiry-policy
        types::put_null(&mut fields); // timeout
        types::put_bool(&mut fields, self.dynamic);
        types::put_list(out, 5, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        let address = fields.opt_string()?;
        let durable = TerminusDurability::from_wire(fields.u32_or(0)?)?;
        fields.skip_one()?; // expiry-policy
        fields.skip_one()?; // timeout
        let dynamic = fields.bool_or(false)?;
        Ok(Self {
            address,
            durable,
            dynamic,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Target {
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub dynamic: bool,
    /// The remote terminus was a transaction coordinator
    pub coordinator: bool,
}

impl Target {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_TARGET);
        let mut fields = BytesMut::new();
        match self.address {
            Some(ref a) => types::put_string(&mut fields, a),
            None => types::put_null(&mut fields),
        }
        types::put_uint(&mut fields, self.durable as u32);
        types::put_null(&mut fields); // expiry-policy
        types::put_null(&mut fields); // timeout
        types::put_bool(&mut fields, self.dynamic);
        types::put_list(out, 5, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        let address = fields.opt_string()?;
        let durable = TerminusDurability::from_wire(fields.u32_or(0)?)?;
        fields.skip_one()?; // expiry-policy
        fields.skip_one()?; // timeout
        let dynamic = fields.bool_or(false)?;
        Ok(Self {
            address,
            durable,
            dynamic,
            coordinator: false,
        })
    }

    fn coordinator() -> Self {
        Self {
            address: None,
            durable: TerminusDurability::None,
            dynamic: false,
            coordinator: true,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Peer idle timeout in milliseconds
    pub idle_timeout: Option<u32>,
}

impl Open {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_OPEN);
        let mut fields = BytesMut::new();
        types::put_string(&mut fields, &self.container_id);
        match self.hostname {
            Some(ref h) => types::put_string(&mut fields, h),
            None => types::put_null(&mut fields),
        }
        types::put_uint(&mut fields, self.max_frame_size);
        types::put_ushort(&mut fields, self.channel_max);
        match self.idle_timeout {
            Some(ms) => types::put_uint(&mut fields, ms),
            None => types::put_null(&mut fields),
        }
        types::put_list(out, 5, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        Ok(Self {
            container_id: fields.required_string("container-id")?,
            hostname: fields.opt_string()?,
            max_frame_size: fields.u32_or(u32::MAX)?,
            channel_max: fields.u16_or(u16::MAX)?,
            idle_timeout: fields.opt_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
}

impl Begin {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_BEGIN);
        let mut fields = BytesMut::new();
        match self.remote_channel {
            Some(ch) => types::put_ushort(&mut fields, ch),
            None => types::put_null(&mut fields),
        }
        types::put_uint(&mut fields, self.next_outgoing_id);
        types::put_uint(&mut fields, self.incoming_window);
        types::put_uint(&mut fields, self.outgoing_window);
        types::put_uint(&mut fields, self.handle_max);
        types::put_list(out, 5, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        Ok(Self {
            remote_channel: fields.opt_u16()?,
            next_outgoing_id: fields.u32_or(0)?,
            incoming_window: fields.u32_or(0)?,
            outgoing_window: fields.u32_or(0)?,
            handle_max: fields.u32_or(u32::MAX)?,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Attach {
    pub name: String,
    pub handle: u32,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    /// Mandatory when the sending role attaches
    pub initial_delivery_count: Option<u32>,
}

impl Attach {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_ATTACH);
        let mut fields = BytesMut::new();
        types::put_string(&mut fields, &self.name);
        types::put_uint(&mut fields, self.handle);
        types::put_bool(&mut fields, self.role.wire());
        types::put_ubyte(&mut fields, self.snd_settle_mode as u8);
        types::put_ubyte(&mut fields, self.rcv_settle_mode as u8);
        match self.source {
            Some(ref s) => s.encode(&mut fields),
            None => types::put_null(&mut fields),
        }
        match self.target {
            Some(ref t) => t.encode(&mut fields),
            None => types::put_null(&mut fields),
        }
        types::put_null(&mut fields); // unsettled
        types::put_bool(&mut fields, false); // incomplete-unsettled
        match self.initial_delivery_count {
            Some(c) => types::put_uint(&mut fields, c),
            None => types::put_null(&mut fields),
        }
        types::put_list(out, 10, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        let name = fields.required_string("link name")?;
        let handle = fields.required_u32("link handle")?;
        let role = Role::from_wire(fields.bool_or(false)?);
        let snd_settle_mode = SenderSettleMode::from_wire(fields.ubyte_or(2)?)?;
        let rcv_settle_mode = ReceiverSettleMode::from_wire(fields.ubyte_or(0)?)?;
        let source = match fields.opt_described()? {
            Some((DESC_SOURCE, mut inner)) => Some(Source::decode(&mut inner)?),
            Some(_) => None,
            None => None,
        };
        let target = match fields.opt_described()? {
            Some((DESC_TARGET, mut inner)) => Some(Target::decode(&mut inner)?),
            Some((DESC_COORDINATOR, _)) => Some(Target::coordinator()),
            Some(_) => None,
            None => None,
        };
        fields.skip_one()?; // unsettled
        fields.skip_one()?; // incomplete-unsettled
        let initial_delivery_count = fields.opt_u32()?;
        Ok(Self {
            name,
            handle,
            role,
            snd_settle_mode,
            rcv_settle_mode,
            source,
            target,
            initial_delivery_count,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    pub handle: Option<u32>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
}

impl Flow {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_FLOW);
        let mut fields = BytesMut::new();
        match self.next_incoming_id {
            Some(v) => types::put_uint(&mut fields, v),
            None => types::put_null(&mut fields),
        }
        types::put_uint(&mut fields, self.incoming_window);
        types::put_uint(&mut fields, self.next_outgoing_id);
        types::put_uint(&mut fields, self.outgoing_window);
        match self.handle {
            Some(v) => types::put_uint(&mut fields, v),
            None => types::put_null(&mut fields),
        }
        match self.delivery_count {
            Some(v) => types::put_uint(&mut fields, v),
            None => types::put_null(&mut fields),
        }
        match self.link_credit {
            Some(v) => types::put_uint(&mut fields, v),
            None => types::put_null(&mut fields),
        }
        types::put_list(out, 7, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        Ok(Self {
            next_incoming_id: fields.opt_u32()?,
            incoming_window: fields.u32_or(0)?,
            next_outgoing_id: fields.u32_or(0)?,
            outgoing_window: fields.u32_or(0)?,
            handle: fields.opt_u32()?,
            delivery_count: fields.opt_u32()?,
            link_credit: fields.opt_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Transfer {
    pub handle: u32,
    pub delivery_id: Option<u32>,
    pub delivery_tag: Option<Bytes>,
    pub settled: Option<bool>,
    pub more: bool,
}

impl Transfer {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_TRANSFER);
        let mut fields = BytesMut::new();
        types::put_uint(&mut fields, self.handle);
        match self.delivery_id {
            Some(v) => types::put_uint(&mut fields, v),
            None => types::put_null(&mut fields),
        }
        match self.delivery_tag {
            Some(ref t) => types::put_binary(&mut fields, t),
            None => types::put_null(&mut fields),
        }
        types::put_uint(&mut fields, 0); // message-format
        match self.settled {
            Some(v) => types::put_bool(&mut fields, v),
            None => types::put_null(&mut fields),
        }
        types::put_bool(&mut fields, self.more);
        types::put_list(out, 6, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        let handle = fields.required_u32("transfer handle")?;
        let delivery_id = fields.opt_u32()?;
        let delivery_tag = fields.opt_binary()?;
        fields.skip_one()?; // message-format
        let settled = fields.opt_bool()?;
        let more = fields.bool_or(false)?;
        Ok(Self {
            handle,
            delivery_id,
            delivery_tag,
            settled,
            more,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Disposition {
    pub role: Role,
    pub first: u32,
    pub last: Option<u32>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
}

impl Disposition {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_DISPOSITION);
        let mut fields = BytesMut::new();
        types::put_bool(&mut fields, self.role.wire());
        types::put_uint(&mut fields, self.first);
        match self.last {
            Some(v) => types::put_uint(&mut fields, v),
            None => types::put_null(&mut fields),
        }
        types::put_bool(&mut fields, self.settled);
        match self.state {
            Some(ref s) => s.encode(&mut fields),
            None => types::put_null(&mut fields),
        }
        types::put_list(out, 5, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        let role = Role::from_wire(fields.bool_or(false)?);
        let first = fields.required_u32("disposition first")?;
        let last = fields.opt_u32()?;
        let settled = fields.bool_or(false)?;
        let state = match fields.opt_described()? {
            Some((code, mut inner)) => Some(DeliveryState::decode(code, &mut inner)?),
            None => None,
        };
        Ok(Self {
            role,
            first,
            last,
            settled,
            state,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Detach {
    pub handle: u32,
    pub closed: bool,
    pub error: Option<ErrorCondition>,
}

impl Detach {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_DETACH);
        let mut fields = BytesMut::new();
        types::put_uint(&mut fields, self.handle);
        types::put_bool(&mut fields, self.closed);
        match self.error {
            Some(ref e) => e.encode(&mut fields),
            None => types::put_null(&mut fields),
        }
        types::put_list(out, 3, &fields);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        Ok(Self {
            handle: fields.required_u32("detach handle")?,
            closed: fields.bool_or(false)?,
            error: fields.opt_error()?,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct End {
    pub error: Option<ErrorCondition>,
}

impl End {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_END);
        encode_optional_error(out, &self.error);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        Ok(Self {
            error: fields.opt_error()?,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Close {
    pub error: Option<ErrorCondition>,
}

impl Close {
    fn encode(&self, out: &mut BytesMut) {
        types::put_descriptor(out, DESC_CLOSE);
        encode_optional_error(out, &self.error);
    }

    fn decode(fields: &mut FieldReader) -> Result<Self, ParseError> {
        Ok(Self {
            error: fields.opt_error()?,
        })
    }
}

fn encode_optional_error(out: &mut BytesMut, error: &Option<ErrorCondition>) {
    match *error {
        Some(ref e) => {
            let mut fields = BytesMut::new();
            e.encode(&mut fields);
            types::put_list(out, 1, &fields);
        }
        None => types::put_list(out, 0, &[]),
    }
}

/// An AMQP-layer performative
#[derive(Debug, Clone)]
pub(crate) enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    pub(crate) fn encode(&self, out: &mut BytesMut) {
        match *self {
            Performative::Open(ref p) => p.encode(out),
            Performative::Begin(ref p) => p.encode(out),
            Performative::Attach(ref p) => p.encode(out),
            Performative::Flow(ref p) => p.encode(out),
            Performative::Transfer(ref p) => p.encode(out),
            Performative::Disposition(ref p) => p.encode(out),
            Performative::Detach(ref p) => p.encode(out),
            Performative::End(ref p) => p.encode(out),
            Performative::Close(ref p) => p.encode(out),
        }
    }
}

/// A SASL-layer frame body
#[derive(Debug, Clone)]
pub(crate) enum SaslBody {
    Mechanisms(Vec<String>),
    Init {
        mechanism: String,
        initial_response: Option<Bytes>,
    },
    Challenge(Bytes),
    Response(Bytes),
    Outcome {
        code: u8,
    },
}

impl SaslBody {
    fn encode(&self, out: &mut BytesMut) {
        match *self {
            SaslBody::Mechanisms(ref mechs) => {
                types::put_descriptor(out, DESC_SASL_MECHANISMS);
                let mut fields = BytesMut::new();
                // a single offered mechanism encodes as a bare symbol
                match mechs.len() {
                    0 => types::put_null(&mut fields),
                    1 => types::put_symbol(&mut fields, &mechs[0]),
                    _ => {
                        let mut body = BytesMut::new();
                        body.put_u8(types::FC_SYM32);
                        for m in mechs {
                            body.put_u32(m.len() as u32);
                            body.put_slice(m.as_bytes());
                        }
                        fields.put_u8(types::FC_ARRAY32);
                        fields.put_u32(4 + body.len() as u32);
                        fields.put_u32(mechs.len() as u32);
                        fields.put_slice(&body);
                    }
                }
                types::put_list(out, 1, &fields);
            }
            SaslBody::Init {
                ref mechanism,
                ref initial_response,
            } => {
                types::put_descriptor(out, DESC_SASL_INIT);
                let mut fields = BytesMut::new();
                types::put_symbol(&mut fields, mechanism);
                match *initial_response {
                    Some(ref r) => types::put_binary(&mut fields, r),
                    None => types::put_null(&mut fields),
                }
                types::put_null(&mut fields); // hostname
                types::put_list(out, 3, &fields);
            }
            SaslBody::Challenge(ref c) => {
                types::put_descriptor(out, DESC_SASL_CHALLENGE);
                let mut fields = BytesMut::new();
                types::put_binary(&mut fields, c);
                types::put_list(out, 1, &fields);
            }
            SaslBody::Response(ref r) => {
                types::put_descriptor(out, DESC_SASL_RESPONSE);
                let mut fields = BytesMut::new();
                types::put_binary(&mut fields, r);
                types::put_list(out, 1, &fields);
            }
            SaslBody::Outcome { code } => {
                types::put_descriptor(out, DESC_SASL_OUTCOME);
                let mut fields = BytesMut::new();
                types::put_ubyte(&mut fields, code);
                types::put_null(&mut fields); // additional-data
                types::put_list(out, 2, &fields);
            }
        }
    }
}

/// SASL outcome code for successful negotiation
pub(crate) const SASL_OK: u8 = 0;
/// SASL outcome code for failed authentication
pub(crate) const SASL_AUTH: u8 = 1;

/// One frame lifted off the wire, header parsed, body still encoded
#[derive(Debug)]
pub(crate) struct RawFrame {
    pub ty: u8,
    pub channel: u16,
    pub body: Bytes,
}

/// Extract the next complete frame from `input`, if one is buffered.
///
/// Frames whose declared size exceeds `max_frame_size` fail the transport.
pub(crate) fn try_frame(
    input: &mut BytesMut,
    max_frame_size: u32,
) -> Result<Option<RawFrame>, ParseError> {
    if input.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let size = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
    if size < FRAME_HEADER_LEN {
        return Err(ParseError::Malformed("frame size below header length"));
    }
    if size > max_frame_size as usize {
        return Err(ParseError::Malformed("frame exceeds negotiated size"));
    }
    if input.len() < size {
        return Ok(None);
    }
    let mut frame = input.split_to(size).freeze();
    frame.advance(4);
    let doff = frame.get_u8() as usize;
    let ty = frame.get_u8();
    let channel = frame.get_u16();
    if doff < 2 || doff * 4 > size {
        return Err(ParseError::Malformed("frame data offset"));
    }
    frame.advance(doff * 4 - FRAME_HEADER_LEN);
    Ok(Some(RawFrame {
        ty,
        channel,
        body: frame,
    }))
}

/// Decode a frame body into a performative plus its payload
pub(crate) fn parse_performative(mut body: Bytes) -> Result<(Performative, Bytes), ParseError> {
    let code = types::get_descriptor(&mut body)?;
    let (count, region) = types::get_list(&mut body)?
        .ok_or(ParseError::Malformed("performative without field list"))?;
    let mut fields = FieldReader::new(count, region);
    let performative = match code {
        DESC_OPEN => Performative::Open(Open::decode(&mut fields)?),
        DESC_BEGIN => Performative::Begin(Begin::decode(&mut fields)?),
        DESC_ATTACH => Performative::Attach(Attach::decode(&mut fields)?),
        DESC_FLOW => Performative::Flow(Flow::decode(&mut fields)?),
        DESC_TRANSFER => Performative::Transfer(Transfer::decode(&mut fields)?),
        DESC_DISPOSITION => Performative::Disposition(Disposition::decode(&mut fields)?),
        DESC_DETACH => Performative::Detach(Detach::decode(&mut fields)?),
        DESC_END => Performative::End(End::decode(&mut fields)?),
        DESC_CLOSE => Performative::Close(Close::decode(&mut fields)?),
        other => return Err(ParseError::UnknownDescriptor(other)),
    };
    Ok((performative, body))
}

/// Decode a SASL frame body
pub(crate) fn parse_sasl(mut body: Bytes) -> Result<SaslBody, ParseError> {
    let code = types::get_descriptor(&mut body)?;
    let (count, region) =
        types::get_list(&mut body)?.ok_or(ParseError::Malformed("sasl body without field list"))?;
    let mut fields = FieldReader::new(count, region);
    Ok(match code {
        DESC_SASL_MECHANISMS => SaslBody::Mechanisms(fields.symbol_multiple()?),
        DESC_SASL_INIT => SaslBody::Init {
            mechanism: fields
                .opt_symbol()?
                .ok_or(ParseError::Malformed("sasl-init without mechanism"))?,
            initial_response: fields.opt_binary()?,
        },
        DESC_SASL_CHALLENGE => SaslBody::Challenge(fields.opt_binary()?.unwrap_or_default()),
        DESC_SASL_RESPONSE => SaslBody::Response(fields.opt_binary()?.unwrap_or_default()),
        DESC_SASL_OUTCOME => SaslBody::Outcome {
            code: fields
                .opt_ubyte()?
                .ok_or(ParseError::Malformed("sasl-outcome without code"))?,
        },
        other => return Err(ParseError::UnknownDescriptor(other)),
    })
}

/// Append one AMQP frame carrying `performative` (and `payload`, for
/// transfers) to `out`
pub(crate) fn encode_frame(
    out: &mut BytesMut,
    channel: u16,
    performative: &Performative,
    payload: &[u8],
) {
    let mut body = BytesMut::new();
    performative.encode(&mut body);
    out.put_u32((FRAME_HEADER_LEN + body.len() + payload.len()) as u32);
    out.put_u8(2);
    out.put_u8(FRAME_TYPE_AMQP);
    out.put_u16(channel);
    out.put_slice(&body);
    out.put_slice(payload);
}

/// Append one SASL frame to `out`
pub(crate) fn encode_sasl_frame(out: &mut BytesMut, body: &SaslBody) {
    let mut encoded = BytesMut::new();
    body.encode(&mut encoded);
    out.put_u32((FRAME_HEADER_LEN + encoded.len()) as u32);
    out.put_u8(2);
    out.put_u8(FRAME_TYPE_SASL);
    out.put_u16(0);
    out.put_slice(&encoded);
}

/// Append an empty (heartbeat) frame to `out`
pub(crate) fn encode_heartbeat(out: &mut BytesMut) {
    out.put_u32(FRAME_HEADER_LEN as u32);
    out.put_u8(2);
    out.put_u8(FRAME_TYPE_AMQP);
    out.put_u16(0);
}

/// Sequential reader over a performative's field list.
///
/// Fields past the encoded count read as AMQP defaults, matching the wire
/// rule that trailing null fields may be truncated.
struct FieldReader {
    remaining: u32,
    region: Bytes,
}

impl FieldReader {
    fn new(count: u32, region: Bytes) -> Self {
        Self {
            remaining: count,
            region,
        }
    }

    fn next_field(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    fn skip_one(&mut self) -> Result<(), ParseError> {
        if self.next_field() {
            types::skip_value(&mut self.region)?;
        }
        Ok(())
    }

    fn opt_bool(&mut self) -> Result<Option<bool>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        types::get_bool(&mut self.region)
    }

    fn bool_or(&mut self, default: bool) -> Result<bool, ParseError> {
        Ok(self.opt_bool()?.unwrap_or(default))
    }

    fn opt_ubyte(&mut self) -> Result<Option<u8>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        types::get_ubyte(&mut self.region)
    }

    fn ubyte_or(&mut self, default: u8) -> Result<u8, ParseError> {
        Ok(self.opt_ubyte()?.unwrap_or(default))
    }

    fn opt_u16(&mut self) -> Result<Option<u16>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        types::get_ushort(&mut self.region)
    }

    fn u16_or(&mut self, default: u16) -> Result<u16, ParseError> {
        Ok(self.opt_u16()?.unwrap_or(default))
    }

    fn opt_u32(&mut self) -> Result<Option<u32>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        types::get_uint(&mut self.region)
    }

    fn u32_or(&mut self, default: u32) -> Result<u32, ParseError> {
        Ok(self.opt_u32()?.unwrap_or(default))
    }

    fn required_u32(&mut self, what: &'static str) -> Result<u32, ParseError> {
        self.opt_u32()?.ok_or(ParseError::MissingField(what))
    }

    fn opt_string(&mut self) -> Result<Option<String>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        types::get_string(&mut self.region)
    }

    fn required_string(&mut self, what: &'static str) -> Result<String, ParseError> {
        self.opt_string()?.ok_or(ParseError::MissingField(what))
    }

    fn opt_symbol(&mut self) -> Result<Option<String>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        types::get_symbol(&mut self.region)
    }

    fn opt_binary(&mut self) -> Result<Option<Bytes>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        types::get_binary(&mut self.region)
    }

    fn symbol_multiple(&mut self) -> Result<Vec<String>, ParseError> {
        if !self.next_field() {
            return Ok(Vec::new());
        }
        types::get_symbol_multiple(&mut self.region)
    }

    /// Read a described value whose body is a list, yielding its descriptor
    /// code and a reader over its fields
    fn opt_described(&mut self) -> Result<Option<(u64, FieldReader)>, ParseError> {
        if !self.next_field() {
            return Ok(None);
        }
        if self.region.first() == Some(&FC_NULL) {
            self.region.advance(1);
            return Ok(None);
        }
        let code = types::get_descriptor(&mut self.region)?;
        let (count, inner) = types::get_list(&mut self.region)?
            .ok_or(ParseError::Malformed("described value without list body"))?;
        Ok(Some((code, FieldReader::new(count, inner))))
    }

    fn opt_error(&mut self) -> Result<Option<ErrorCondition>, ParseError> {
        match self.opt_described()? {
            Some((DESC_ERROR, mut inner)) => Ok(Some(ErrorCondition::decode(&mut inner)?)),
            Some((other, _)) => Err(ParseError::UnknownDescriptor(other)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::types::ParseError;

    fn roundtrip(performative: Performative, payload: &[u8]) -> (Performative, Bytes) {
        let mut out = BytesMut::new();
        encode_frame(&mut out, 3, &performative, payload);
        let raw = try_frame(&mut out, 1 << 20).unwrap().unwrap();
        assert!(out.is_empty());
        assert_eq!(raw.ty, FRAME_TYPE_AMQP);
        assert_eq!(raw.channel, 3);
        parse_performative(raw.body).unwrap()
    }

    #[test]
    fn open_roundtrip() {
        let open = Open {
            container_id: "CORDA:1234".into(),
            hostname: None,
            max_frame_size: 131_072,
            channel_max: 255,
            idle_timeout: Some(10_000),
        };
        let (parsed, payload) = roundtrip(Performative::Open(open), &[]);
        assert!(payload.is_empty());
        match parsed {
            Performative::Open(o) => {
                assert_eq!(o.container_id, "CORDA:1234");
                assert_eq!(o.max_frame_size, 131_072);
                assert_eq!(o.idle_timeout, Some(10_000));
            }
            other => panic!("unexpected performative: {other:?}"),
        }
    }

    #[test]
    fn attach_roundtrip_carries_termini() {
        let attach = Attach {
            name: "e4f2".into(),
            handle: 0,
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Source {
                address: Some("addr1".into()),
                durable: TerminusDurability::None,
                dynamic: false,
            }),
            target: Some(Target {
                address: Some("addr1".into()),
                durable: TerminusDurability::UnsettledState,
                dynamic: false,
                coordinator: false,
            }),
            initial_delivery_count: Some(0),
        };
        let (parsed, _) = roundtrip(Performative::Attach(attach), &[]);
        match parsed {
            Performative::Attach(a) => {
                assert_eq!(a.role, Role::Sender);
                assert_eq!(a.snd_settle_mode, SenderSettleMode::Unsettled);
                assert_eq!(a.rcv_settle_mode, ReceiverSettleMode::First);
                assert_eq!(a.source.unwrap().address.as_deref(), Some("addr1"));
                let target = a.target.unwrap();
                assert_eq!(target.address.as_deref(), Some("addr1"));
                assert_eq!(target.durable, TerminusDurability::UnsettledState);
            }
            other => panic!("unexpected performative: {other:?}"),
        }
    }

    #[test]
    fn transfer_keeps_payload() {
        let transfer = Transfer {
            handle: 1,
            delivery_id: Some(7),
            delivery_tag: Some(Bytes::from_static(&[0, 0, 0, 7])),
            settled: Some(false),
            more: false,
        };
        let (parsed, payload) = roundtrip(Performative::Transfer(transfer), &[0xde, 0xad]);
        assert_eq!(&payload[..], &[0xde, 0xad]);
        match parsed {
            Performative::Transfer(t) => {
                assert_eq!(t.delivery_id, Some(7));
                assert_eq!(t.delivery_tag.unwrap(), Bytes::from_static(&[0, 0, 0, 7]));
                assert!(!t.more);
            }
            other => panic!("unexpected performative: {other:?}"),
        }
    }

    #[test]
    fn disposition_rejected_roundtrip() {
        let disposition = Disposition {
            role: Role::Receiver,
            first: 2,
            last: Some(4),
            settled: true,
            state: Some(DeliveryState::Rejected(Some(ErrorCondition::new(
                "amqp:unauthorized-access",
                "AMQ119032: address refused",
            )))),
        };
        let (parsed, _) = roundtrip(Performative::Disposition(disposition), &[]);
        match parsed {
            Performative::Disposition(d) => {
                assert_eq!(d.first, 2);
                assert_eq!(d.last, Some(4));
                assert!(d.settled);
                match d.state.unwrap() {
                    DeliveryState::Rejected(Some(e)) => {
                        assert!(e.description.unwrap().contains("AMQ119032"));
                    }
                    other => panic!("unexpected state: {other:?}"),
                }
            }
            other => panic!("unexpected performative: {other:?}"),
        }
    }

    #[test]
    fn detach_without_description() {
        let detach = Detach {
            handle: 9,
            closed: true,
            error: Some(ErrorCondition {
                condition: "amqp:link:detach-forced".into(),
                description: None,
            }),
        };
        let (parsed, _) = roundtrip(Performative::Detach(detach), &[]);
        match parsed {
            Performative::Detach(d) => {
                let error = d.error.unwrap();
                assert_eq!(error.condition, "amqp:link:detach-forced");
                assert!(error.description.is_none());
            }
            other => panic!("unexpected performative: {other:?}"),
        }
    }

    #[test]
    fn sasl_roundtrips() {
        let mut out = BytesMut::new();
        encode_sasl_frame(&mut out, &SaslBody::Mechanisms(vec!["PLAIN".into()]));
        encode_sasl_frame(
            &mut out,
            &SaslBody::Init {
                mechanism: "PLAIN".into(),
                initial_response: Some(Bytes::from_static(b"\0user\0pass")),
            },
        );
        encode_sasl_frame(&mut out, &SaslBody::Outcome { code: SASL_OK });

        let raw = try_frame(&mut out, 1 << 20).unwrap().unwrap();
        assert_eq!(raw.ty, FRAME_TYPE_SASL);
        match parse_sasl(raw.body).unwrap() {
            SaslBody::Mechanisms(m) => assert_eq!(m, vec!["PLAIN".to_owned()]),
            other => panic!("unexpected sasl body: {other:?}"),
        }
        let raw = try_frame(&mut out, 1 << 20).unwrap().unwrap();
        match parse_sasl(raw.body).unwrap() {
            SaslBody::Init {
                mechanism,
                initial_response,
            } => {
                assert_eq!(mechanism, "PLAIN");
                assert_eq!(initial_response.unwrap(), Bytes::from_static(b"\0user\0pass"));
            }
            other => panic!("unexpected sasl body: {other:?}"),
        }
        let raw = try_frame(&mut out, 1 << 20).unwrap().unwrap();
        assert_matches::assert_matches!(
            parse_sasl(raw.body).unwrap(),
            SaslBody::Outcome { code: SASL_OK }
        );
    }

    #[test]
    fn heartbeat_is_empty_frame() {
        let mut out = BytesMut::new();
        encode_heartbeat(&mut out);
        assert_eq!(out[..], hex!("00 00 00 08 02 00 00 00")[..]);
        let raw = try_frame(&mut out, 512).unwrap().unwrap();
        assert!(raw.body.is_empty());
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut input = BytesMut::new();
        input.put_u32(600);
        input.put_slice(&[2, 0, 0, 0]);
        assert_matches::assert_matches!(try_frame(&mut input, 512), Err(ParseError::Malformed(_)));
    }

    #[test]
    fn short_buffer_yields_no_frame() {
        let mut input = BytesMut::from(&[0u8, 0, 1][..]);
        assert!(try_frame(&mut input, 512).unwrap().is_none());
        assert_eq!(input.len(), 3);
    }
}
