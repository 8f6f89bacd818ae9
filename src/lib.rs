//! Sans-I/O AMQP 1.0 peer-link state machine.
//!
//! One [`Connection`] drives a single peer-to-peer AMQP 1.0 link inside a
//! ledger node's messaging layer. The caller owns the socket: it feeds
//! inbound byte chunks to [`Connection::process_input`], drains outbound
//! chunks from [`Connection::poll_output`], polls application events from
//! [`Connection::poll`], and drives time through
//! [`Connection::poll_timeout`] / [`Connection::handle_timeout`]. No
//! sockets, threads, or async runtime are used here; back-pressure is
//! expressed purely through AMQP link credit.

use std::{env, fmt, net::SocketAddr, ops, time::Duration};

mod coding;
mod types;
pub use crate::types::PropertyValue;

mod frame;

mod codec;
pub use crate::codec::{DecodeError, EncodeError};

mod message;
pub use crate::message::{DeliveryHandle, MessageStatus, ReceivedMessage, SendableMessage};

mod engine;

mod connection;
pub use crate::connection::{Connection, Event};

#[cfg(test)]
mod tests;

/// Default maximum AMQP frame size in bytes, overridable via the
/// `AmqpMaxFrameSize` environment variable.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 131_072;

/// Default idle timeout, overridable (in milliseconds) via the
/// `AmqpIdleTimeout` environment variable.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default credit window granted to remote senders on each inbound link.
pub const DEFAULT_LINK_CREDIT: u32 = 256;

/// Application-properties key conveying the authenticated peer identity.
///
/// Outbound messages carry the local legal name under this key; inbound
/// messages have any peer-supplied value replaced with the identity
/// authenticated at connection setup.
pub const VALIDATED_USER_KEY: &str = "_AMQ_VALIDATED_USER";

/// Broker error code meaning the destination address cannot be created on
/// the peer. Non-retryable: queued messages for the address are abandoned.
pub const ADDRESS_CREATE_REFUSED: &str = "AMQ119032";

pub(crate) const CONTAINER_ID_PREFIX: &str = "CORDA:";

/// Smallest max-frame-size AMQP 1.0 permits an endpoint to announce.
pub(crate) const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Whether an endpoint dialed the connection or accepted it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Side::Client => "client",
            Side::Server => "server",
        })
    }
}

/// Parameters governing one peer link
///
/// Legal names identify the two parties at the messaging-fabric level; the
/// socket addresses are those of the already-established transport below
/// and are only echoed into [`ReceivedMessage`] records. Credentials select
/// SASL PLAIN when present and ANONYMOUS otherwise; actual authentication
/// policy lives in a higher layer.
pub struct ConnectionConfig {
    /// Whether this endpoint dialed or accepted the underlying socket
    pub side: Side,
    /// X.500-style legal name of this node
    pub local_legal_name: String,
    /// Expected legal name of the peer, authenticated by the TLS layer below
    pub remote_legal_name: String,
    /// Local address of the underlying socket
    pub local_address: SocketAddr,
    /// Remote address of the underlying socket
    pub remote_address: SocketAddr,
    /// SASL PLAIN username; `None` selects ANONYMOUS
    pub username: Option<String>,
    /// SASL PLAIN password, ignored under ANONYMOUS
    pub password: Option<String>,
    /// Maximum frame size announced to the peer
    pub max_frame_size: u32,
    /// Inactivity window after which the link is torn down
    pub idle_timeout: Duration,
    /// Credit window granted to remote senders on inbound links
    pub link_credit: u32,
}

impl ConnectionConfig {
    pub fn new(
        side: Side,
        local_legal_name: impl Into<String>,
        remote_legal_name: impl Into<String>,
    ) -> Self {
        Self {
            side,
            local_legal_name: local_legal_name.into(),
            remote_legal_name: remote_legal_name.into(),
            local_address: unspecified_addr(),
            remote_address: unspecified_addr(),
            username: None,
            password: None,
            max_frame_size: env_u32("AmqpMaxFrameSize")
                .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
                .max(MIN_MAX_FRAME_SIZE),
            idle_timeout: env_u32("AmqpIdleTimeout")
                .map(|ms| Duration::from_millis(ms.into()))
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            link_credit: DEFAULT_LINK_CREDIT,
        }
    }

    /// Authenticate with SASL PLAIN instead of ANONYMOUS
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn addresses(mut self, local: SocketAddr, remote: SocketAddr) -> Self {
        self.local_address = local;
        self.remote_address = remote;
        self
    }
}

fn unspecified_addr() -> SocketAddr {
    use std::net::{Ipv4Addr, SocketAddrV4};
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

fn env_u32(name: &str) -> Option<u32> {
    env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ConnectionConfig::new(Side::Client, "O=Alice,L=London,C=GB", "O=Bob,L=NY,C=US");
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(config.username.is_none());
    }

    #[test]
    fn side_negation() {
        assert_eq!(!Side::Client, Side::Server);
        assert!(Side::Server.is_server());
    }
}
