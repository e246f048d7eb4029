//! Test helpers for relay integration tests.
//!
//! Provides TestRelay and TestPeer for driving a relay over real sockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use chatrelay::config::{LimitsConfig, ServerConfig};
use chatrelay::server::RosterEntry;
use chatrelay::{ChatMessage, PeerConnection, PeerEvent, PeerStatus, RelayHandle, RelayServer};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet period used to assert that nothing else arrives.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// A relay bound to an ephemeral loopback port.
pub struct TestRelay {
    pub handle: RelayHandle,
    pub host_name: String,
}

impl TestRelay {
    /// Start a relay hosted by `host_name`.
    pub async fn start(
        host_name: &str,
        max_connections: usize,
        min_connections: usize,
        shutdown_countdown_secs: u64,
    ) -> Self {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            min_connections,
            shutdown_countdown_secs,
            ..ServerConfig::default()
        };
        let handle = RelayServer::bind(&config, LimitsConfig::default(), host_name)
            .await
            .expect("bind relay")
            .spawn()
            .expect("spawn relay");
        Self {
            handle,
            host_name: host_name.to_string(),
        }
    }

    /// Relay with room for `max_connections` and no under-population shutdown.
    pub async fn open(host_name: &str, max_connections: usize) -> Self {
        Self::start(host_name, max_connections, 0, 30).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Connect and wait for the relay to announce the join.
    pub async fn join(&self, username: &str) -> TestPeer {
        let host_key = (username == self.host_name).then(|| self.handle.host_key());
        let mut peer = TestPeer::connect(self.addr(), username, host_key).await;
        peer.expect_message(&format!("{username} joined the chat"))
            .await;
        peer
    }

    /// Names of the bound participants, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.participants()
            .await
            .into_iter()
            .map(|entry| entry.username)
            .collect()
    }

    pub async fn participants(&self) -> Vec<RosterEntry> {
        self.handle.participants().await
    }

    /// Wait for the relay to shut down.
    pub async fn wait_shutdown(self) {
        timeout(DEFAULT_TIMEOUT, self.handle.wait())
            .await
            .expect("relay did not shut down");
    }
}

/// A peer connection plus its event stream.
pub struct TestPeer {
    pub conn: PeerConnection,
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl TestPeer {
    /// Connect and consume the initial connected status.
    pub async fn connect(addr: SocketAddr, username: &str, host_key: Option<&str>) -> Self {
        let (conn, mut events) =
            PeerConnection::connect(addr, username, host_key, LimitsConfig::default())
                .await
                .expect("connect peer");
        match events.recv().await {
            Some(PeerEvent::StatusChanged(status)) => assert!(status.is_connected),
            other => panic!("expected initial status, got {other:?}"),
        }
        Self { conn, events }
    }

    /// Next event, failing the test after [`DEFAULT_TIMEOUT`].
    pub async fn next_event(&mut self) -> PeerEvent {
        timeout(DEFAULT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    /// Skip events until a message with exactly `content` arrives.
    pub async fn expect_message(&mut self, content: &str) -> ChatMessage {
        loop {
            if let PeerEvent::MessageReceived(message) = self.next_event().await {
                if message.content == content {
                    return message;
                }
            }
        }
    }

    /// Skip events until a status satisfying `pred` arrives.
    pub async fn expect_status<F>(&mut self, pred: F) -> PeerStatus
    where
        F: Fn(&PeerStatus) -> bool,
    {
        loop {
            if let PeerEvent::StatusChanged(status) = self.next_event().await {
                if pred(&status) {
                    return status;
                }
            }
        }
    }

    /// Wait until the connection reports itself disconnected.
    pub async fn expect_disconnected(&mut self) {
        self.expect_status(|s| !s.is_connected).await;
    }

    /// Everything that arrives within [`QUIET_PERIOD`] of the previous event.
    pub async fn drain(&mut self) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(QUIET_PERIOD, self.events.recv()).await {
            events.push(event);
        }
        events
    }
}

/// Contents of the messages among `events`.
pub fn contents(events: &[PeerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            PeerEvent::MessageReceived(message) => Some(message.content.clone()),
            PeerEvent::StatusChanged(_) => None,
        })
        .collect()
}
