use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::*;

pub const CLIENT_NAME: &str = "O=Alice Corp,L=Madrid,C=ES";
pub const SERVER_NAME: &str = "O=Bob Plc,L=Rome,C=IT";

pub fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

pub fn client_config() -> ConnectionConfig {
    ConnectionConfig::new(Side::Client, CLIENT_NAME, SERVER_NAME).addresses(
        "10.0.0.2:54321".parse().unwrap(),
        "10.0.0.1:10001".parse().unwrap(),
    )
}

pub fn server_config() -> ConnectionConfig {
    ConnectionConfig::new(Side::Server, SERVER_NAME, CLIENT_NAME).addresses(
        "10.0.0.1:10001".parse().unwrap(),
        "10.0.0.2:54321".parse().unwrap(),
    )
}

/// Observed terminal status of a tracked message
pub type StatusProbe = Arc<Mutex<Option<MessageStatus>>>;

pub fn tracked(topic: &str, payload: &[u8]) -> (SendableMessage, StatusProbe) {
    let probe: StatusProbe = Arc::new(Mutex::new(None));
    let observer = probe.clone();
    let message = SendableMessage::new(topic, Bytes::copy_from_slice(payload))
        .on_complete(move |status| *observer.lock().unwrap() = Some(status));
    (message, probe)
}

pub fn status(probe: &StatusProbe) -> Option<MessageStatus> {
    *probe.lock().unwrap()
}

/// Move every pending outbound chunk from one connection into the other
pub fn pump(time: Instant, from: &mut Connection, to: &mut Connection) -> bool {
    let mut moved = false;
    while let Some(bytes) = from.poll_output() {
        to.process_input(time, &bytes);
        moved = true;
    }
    moved
}

/// A client/server connection pair shuttling byte chunks in memory
pub struct Pair {
    pub client: Connection,
    pub server: Connection,
    pub time: Instant,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_configs(client_config(), server_config())
    }

    pub fn with_configs(client: ConnectionConfig, server: ConnectionConfig) -> Self {
        Self {
            client: Connection::new(client),
            server: Connection::new(server),
            time: Instant::now(),
        }
    }

    /// A pair with the handshake already driven to completion
    pub fn connect() -> Self {
        let mut pair = Self::new();
        pair.drive();
        assert!(pair.client.remote_container_id().is_some());
        assert!(pair.server.remote_container_id().is_some());
        pair
    }

    pub fn step(&mut self) -> bool {
        let client_moved = pump(self.time, &mut self.client, &mut self.server);
        let server_moved = pump(self.time, &mut self.server, &mut self.client);
        client_moved || server_moved
    }

    /// Shuttle until both connections go quiet
    pub fn drive(&mut self) {
        while self.step() {}
    }

    /// Advance both clocks, fire timers, and settle the wire again
    pub fn advance(&mut self, by: Duration) {
        self.time += by;
        self.client.handle_timeout(self.time);
        self.server.handle_timeout(self.time);
        self.drive();
    }
}
