//! SASL negotiation layer.
//!
//! Runs before the AMQP frame layer. PLAIN is selected when credentials
//! are configured, ANONYMOUS otherwise. The server role accepts a matching
//! init immediately; authentication policy lives above this core.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use crate::frame::{self, SaslBody, SASL_AUTH, SASL_OK};
use crate::Side;

pub(crate) const MECH_PLAIN: &str = "PLAIN";
pub(crate) const MECH_ANONYMOUS: &str = "ANONYMOUS";

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub(crate) enum SaslError {
    #[error("peer sent a non-sasl protocol header")]
    BadHeader,
    #[error("peer does not offer mechanism {0}")]
    MechanismUnavailable(String),
    #[error("peer initiated unsupported mechanism {0}")]
    MechanismMismatch(String),
    #[error("negotiation failed with outcome code {0}")]
    Failed(u8),
    #[error("unexpected sasl frame")]
    UnexpectedFrame,
}

#[derive(Debug, Clone)]
pub(crate) enum SaslConfig {
    Anonymous,
    Plain { username: String, password: String },
}

impl SaslConfig {
    fn mechanism(&self) -> &'static str {
        match *self {
            SaslConfig::Anonymous => MECH_ANONYMOUS,
            SaslConfig::Plain { .. } => MECH_PLAIN,
        }
    }

    fn initial_response(&self) -> Option<Bytes> {
        match *self {
            SaslConfig::Anonymous => None,
            SaslConfig::Plain {
                ref username,
                ref password,
            } => {
                let mut response = BytesMut::with_capacity(username.len() + password.len() + 2);
                response.put_u8(0);
                response.put_slice(username.as_bytes());
                response.put_u8(0);
                response.put_slice(password.as_bytes());
                Some(response.freeze())
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Progress {
    Negotiating,
    Done,
    Failed,
}

pub(crate) struct Sasl {
    side: Side,
    config: SaslConfig,
    progress: Progress,
    header_sent: bool,
    header_received: bool,
    queued: Vec<SaslBody>,
}

impl Sasl {
    pub(crate) fn new(side: Side, config: SaslConfig) -> Self {
        Self {
            side,
            config,
            progress: Progress::Negotiating,
            header_sent: false,
            header_received: false,
            queued: Vec::new(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.progress == Progress::Done
    }

    pub(crate) fn header_received(&self) -> bool {
        self.header_received
    }

    pub(crate) fn receive_header(&mut self, header: &[u8]) -> Result<(), SaslError> {
        if header != &frame::SASL_HEADER[..] {
            self.progress = Progress::Failed;
            return Err(SaslError::BadHeader);
        }
        self.header_received = true;
        Ok(())
    }

    /// Append any due negotiation bytes to `out`
    pub(crate) fn output(&mut self, out: &mut BytesMut) {
        if !self.header_sent {
            self.header_sent = true;
            out.put_slice(&frame::SASL_HEADER);
            if self.side.is_server() {
                // offers go out with the header; no need to wait for the peer
                self.queued
                    .push(SaslBody::Mechanisms(vec![self.config.mechanism().to_owned()]));
            }
        }
        for body in self.queued.drain(..) {
            frame::encode_sasl_frame(out, &body);
        }
    }

    pub(crate) fn handle(&mut self, body: SaslBody) -> Result<(), SaslError> {
        match (self.side, body) {
            (Side::Client, SaslBody::Mechanisms(offered)) => {
                let ours = self.config.mechanism();
                if !offered.iter().any(|m| m == ours) {
                    self.progress = Progress::Failed;
                    return Err(SaslError::MechanismUnavailable(ours.to_owned()));
                }
                trace!(mechanism = ours, "initiating sasl exchange");
                self.queued.push(SaslBody::Init {
                    mechanism: ours.to_owned(),
                    initial_response: self.config.initial_response(),
                });
                Ok(())
            }
            (Side::Client, SaslBody::Outcome { code }) => {
                if code == SASL_OK {
                    debug!("sasl negotiation complete");
                    self.progress = Progress::Done;
                    Ok(())
                } else {
                    self.progress = Progress::Failed;
                    Err(SaslError::Failed(code))
                }
            }
            (Side::Server, SaslBody::Init { mechanism, .. }) => {
                if mechanism != self.config.mechanism() {
                    self.queued.push(SaslBody::Outcome { code: SASL_AUTH });
                    self.progress = Progress::Failed;
                    return Err(SaslError::MechanismMismatch(mechanism));
                }
                // policy says yes; credentials are checked by a higher layer
                debug!(mechanism = %mechanism, "accepting sasl init");
                self.queued.push(SaslBody::Outcome { code: SASL_OK });
                self.progress = Progress::Done;
                Ok(())
            }
            (_, _) => {
                self.progress = Progress::Failed;
                Err(SaslError::UnexpectedFrame)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shuttle(from: &mut Sasl, to: &mut Sasl) {
        let mut wire = BytesMut::new();
        from.output(&mut wire);
        if !to.header_received() && wire.len() >= 8 {
            let header = wire.split_to(8);
            to.receive_header(&header).unwrap();
        }
        while let Some(raw) = frame::try_frame(&mut wire, 4096).unwrap() {
            to.handle(frame::parse_sasl(raw.body).unwrap()).unwrap();
        }
    }

    #[test]
    fn plain_exchange_completes() {
        let config = |_: Side| SaslConfig::Plain {
            username: "node".into(),
            password: "secret".into(),
        };
        let mut client = Sasl::new(Side::Client, config(Side::Client));
        let mut server = Sasl::new(Side::Server, config(Side::Server));
        for _ in 0..4 {
            shuttle(&mut server, &mut client);
            shuttle(&mut client, &mut server);
        }
        assert!(client.is_done());
        assert!(server.is_done());
    }

    #[test]
    fn anonymous_exchange_completes() {
        let mut client = Sasl::new(Side::Client, SaslConfig::Anonymous);
        let mut server = Sasl::new(Side::Server, SaslConfig::Anonymous);
        for _ in 0..4 {
            shuttle(&mut server, &mut client);
            shuttle(&mut client, &mut server);
        }
        assert!(client.is_done());
        assert!(server.is_done());
    }

    #[test]
    fn mechanism_mismatch_fails_the_server() {
        let mut client = Sasl::new(Side::Client, SaslConfig::Anonymous);
        let mut server = Sasl::new(
            Side::Server,
            SaslConfig::Plain {
                username: "node".into(),
                password: "secret".into(),
            },
        );
        // server offers PLAIN; the client cannot proceed
        let mut wire = BytesMut::new();
        server.output(&mut wire);
        let header = wire.split_to(8);
        client.receive_header(&header).unwrap();
        let raw = frame::try_frame(&mut wire, 4096).unwrap().unwrap();
        let err = client.handle(frame::parse_sasl(raw.body).unwrap()).unwrap_err();
        assert_eq!(err, SaslError::MechanismUnavailable("ANONYMOUS".into()));
    }
}
