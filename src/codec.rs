//! Application-message codec.
//!
//! Outbound messages encode as a bare AMQP 1.0 message: a header with
//! `durable = true`, an empty properties section, an application-properties
//! map carrying the caller's properties plus the authenticated local
//! identity, and a single data section holding the opaque payload. Inbound
//! decoding accepts any section ordering, skips sections it does not
//! consume, and refuses non-data bodies.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::message::SendableMessage;
use crate::types::{self, ParseError, PropertyValue};
use crate::VALIDATED_USER_KEY;

// Message section descriptor codes
const SECT_HEADER: u64 = 0x70;
const SECT_DELIVERY_ANNOTATIONS: u64 = 0x71;
const SECT_MESSAGE_ANNOTATIONS: u64 = 0x72;
const SECT_PROPERTIES: u64 = 0x73;
const SECT_APPLICATION_PROPERTIES: u64 = 0x74;
const SECT_DATA: u64 = 0x75;
const SECT_AMQP_SEQUENCE: u64 = 0x76;
const SECT_AMQP_VALUE: u64 = 0x77;
const SECT_FOOTER: u64 = 0x78;

/// Failure to serialize an outbound message. The message is fatally
/// undeliverable and completes `Rejected`.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum EncodeError {
    #[error("payload exceeds the wire's 32-bit length limit")]
    PayloadTooLarge,
    #[error("application properties exceed the wire's 32-bit length limit")]
    PropertiesTooLarge,
}

/// Failure to decode an inbound message; the delivery is rejected
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message body is not a data section")]
    UnsupportedBody,
    #[error("message carries no body")]
    MissingBody,
}

impl From<ParseError> for DecodeError {
    fn from(e: ParseError) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

/// An inbound message's decoded sections
#[derive(Debug, Clone)]
pub(crate) struct DecodedMessage {
    pub durable: bool,
    pub properties: Vec<(String, PropertyValue)>,
    pub payload: Bytes,
}

/// Serialize `msg` for the wire, asserting `local_legal_name` as the
/// authenticated sender identity
pub(crate) fn encode(msg: &SendableMessage, local_legal_name: &str) -> Result<Bytes, EncodeError> {
    if msg.payload().len() > u32::MAX as usize {
        return Err(EncodeError::PayloadTooLarge);
    }
    let mut out = BytesMut::with_capacity(msg.payload().len() + 64);

    types::put_descriptor(&mut out, SECT_HEADER);
    let mut fields = BytesMut::new();
    types::put_bool(&mut fields, true); // durable
    types::put_list(&mut out, 1, &fields);

    types::put_descriptor(&mut out, SECT_PROPERTIES);
    types::put_list(&mut out, 0, &[]);

    types::put_descriptor(&mut out, SECT_APPLICATION_PROPERTIES);
    let mut elements = BytesMut::new();
    let mut count = 0usize;
    for (key, value) in msg.properties() {
        // the trust assertion is ours to make, not the caller's
        if key == VALIDATED_USER_KEY {
            continue;
        }
        types::put_string(&mut elements, key);
        value.encode(&mut elements);
        count += 2;
    }
    types::put_string(&mut elements, VALIDATED_USER_KEY);
    types::put_string(&mut elements, local_legal_name);
    count += 2;
    if elements.len() > u32::MAX as usize - 4 {
        return Err(EncodeError::PropertiesTooLarge);
    }
    types::put_map(&mut out, count, &elements);

    types::put_descriptor(&mut out, SECT_DATA);
    types::put_binary(&mut out, msg.payload());

    Ok(out.freeze())
}

/// Decode a complete inbound message
pub(crate) fn decode(bytes: Bytes) -> Result<DecodedMessage, DecodeError> {
    let mut buf = bytes;
    let mut durable = false;
    let mut properties = Vec::new();
    let mut payload: Option<BytesMut> = None;

    while !buf.is_empty() {
        let code = types::get_descriptor(&mut buf)?;
        match code {
            SECT_HEADER => {
                let (count, mut region) = types::get_list(&mut buf)?
                    .ok_or_else(|| DecodeError::Malformed("null header section".into()))?;
                if count >= 1 {
                    durable = types::get_bool(&mut region)?.unwrap_or(false);
                }
            }
            SECT_APPLICATION_PROPERTIES => {
                let (count, mut region) = types::get_map(&mut buf)?.unwrap_or((0, Bytes::new()));
                if count % 2 != 0 {
                    return Err(DecodeError::Malformed("odd map element count".into()));
                }
                for _ in 0..count / 2 {
                    let key = types::get_string(&mut region)?
                        .ok_or_else(|| DecodeError::Malformed("null property key".into()))?;
                    let value = PropertyValue::decode(&mut region)?;
                    properties.push((key, value));
                }
            }
            SECT_DATA => {
                let chunk = types::get_binary(&mut buf)?
                    .ok_or_else(|| DecodeError::Malformed("null data section".into()))?;
                match payload {
                    Some(ref mut acc) => acc.extend_from_slice(&chunk),
                    None => payload = Some(BytesMut::from(&chunk[..])),
                }
            }
            SECT_AMQP_VALUE | SECT_AMQP_SEQUENCE => return Err(DecodeError::UnsupportedBody),
            SECT_PROPERTIES
            | SECT_DELIVERY_ANNOTATIONS
            | SECT_MESSAGE_ANNOTATIONS
            | SECT_FOOTER => {
                types::skip_value(&mut buf)?;
            }
            _ => {
                types::skip_value(&mut buf)?;
            }
        }
    }

    Ok(DecodedMessage {
        durable,
        properties,
        payload: payload.ok_or(DecodeError::MissingBody)?.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_payload_and_properties() {
        let msg = SendableMessage::new("addr1", Bytes::from_static(&[0xde, 0xad]))
            .with_property("id", "u1")
            .with_property("attempt", PropertyValue::Uint(2));
        let wire = encode(&msg, "O=Alice,L=London,C=GB").unwrap();
        let decoded = decode(wire).unwrap();

        assert!(decoded.durable);
        assert_eq!(&decoded.payload[..], &[0xde, 0xad]);
        assert_eq!(
            decoded.properties,
            vec![
                ("id".to_owned(), PropertyValue::String("u1".into())),
                ("attempt".to_owned(), PropertyValue::Uint(2)),
                (
                    VALIDATED_USER_KEY.to_owned(),
                    PropertyValue::String("O=Alice,L=London,C=GB".into()),
                ),
            ],
        );
    }

    #[test]
    fn caller_cannot_spoof_validated_user() {
        let msg = SendableMessage::new("addr1", Bytes::from_static(&[1]))
            .with_property(VALIDATED_USER_KEY, "O=Mallory,L=Oslo,C=NO");
        let wire = encode(&msg, "O=Alice,L=London,C=GB").unwrap();
        let decoded = decode(wire).unwrap();
        let asserted: Vec<_> = decoded
            .properties
            .iter()
            .filter(|(k, _)| k == VALIDATED_USER_KEY)
            .collect();
        assert_eq!(asserted.len(), 1);
        assert_eq!(
            asserted[0].1,
            PropertyValue::String("O=Alice,L=London,C=GB".into())
        );
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let msg = SendableMessage::new("addr1", Bytes::from_static(b"x"));
        let encoded = encode(&msg, "O=Alice,L=London,C=GB").unwrap();

        // prepend a message-annotations section
        let mut prefixed = BytesMut::new();
        types::put_descriptor(&mut prefixed, SECT_MESSAGE_ANNOTATIONS);
        let mut elements = BytesMut::new();
        types::put_symbol(&mut elements, "x-opt-route");
        types::put_string(&mut elements, "east");
        types::put_map(&mut prefixed, 2, &elements);
        prefixed.extend_from_slice(&encoded);

        let decoded = decode(prefixed.freeze()).unwrap();
        assert_eq!(&decoded.payload[..], b"x");
    }

    #[test]
    fn missing_body_is_an_error() {
        let msg = SendableMessage::new("addr1", Bytes::new());
        let mut wire = BytesMut::from(&encode(&msg, "n").unwrap()[..]);
        // strip the trailing data section (descriptor + empty binary)
        let new_len = wire.len() - 5;
        wire.truncate(new_len);
        assert_eq!(decode(wire.freeze()).unwrap_err(), DecodeError::MissingBody);
    }

    #[test]
    fn value_body_is_refused() {
        let mut wire = BytesMut::new();
        types::put_descriptor(&mut wire, SECT_AMQP_VALUE);
        types::put_string(&mut wire, "not data");
        assert_eq!(decode(wire.freeze()).unwrap_err(), DecodeError::UnsupportedBody);
    }
}
