//! TCP listener and accept loop for the relay server.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::connection::{read_loop, write_loop, HandlerSettings};
use super::coordinator::{capacity_notice, Coordinator, RosterEvent, RosterSnapshot, ServerState};
use super::roster::{Connection, Roster, RosterEntry};
use crate::chat::ChatMessage;
use crate::config::{LimitsConfig, ServerConfig};
use crate::protocol::{encode_message, format_info, frame_codec, Verb};
use crate::{RelayError, Result};

/// Depth of the coordinator's event queue.
const EVENT_QUEUE: usize = 256;

/// How long a refused connection may take to hang up.
const REFUSAL_DRAIN: Duration = Duration::from_secs(2);

/// A bound relay server that has not started accepting yet.
pub struct RelayServer {
    listener: TcpListener,
    config: ServerConfig,
    limits: LimitsConfig,
    host_name: String,
}

impl RelayServer {
    /// Bind the relay for a session hosted by `host_name`.
    pub async fn bind(
        config: &ServerConfig,
        limits: LimitsConfig,
        host_name: impl Into<String>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        let host_name = host_name.into();

        info!(
            "Relay for {} listening on {} (capacity {}, minimum {})",
            host_name,
            listener.local_addr()?,
            config.max_connections,
            config.min_connections
        );

        Ok(Self {
            listener,
            config: config.clone(),
            limits,
            host_name,
        })
    }

    /// Get the local address the relay is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A bound server is always `Listening`.
    pub fn state(&self) -> ServerState {
        ServerState::Listening
    }

    /// Start the coordinator and accept loop in the background.
    pub fn spawn(self) -> Result<RelayHandle> {
        let local_addr = self.listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (state_tx, state_rx) = watch::channel(ServerState::Listening);
        let host_key = Uuid::new_v4().simple().to_string();

        let coordinator = Coordinator::new(
            Roster::new(self.host_name, self.config.max_connections).with_host_key(&host_key),
            self.config.min_connections,
            self.config.shutdown_countdown(),
            events_rx,
            state_tx,
        );
        tokio::spawn(coordinator.run());

        let acceptor = Acceptor {
            listener: self.listener,
            events: events_tx.clone(),
            state: state_rx.clone(),
            outbound_queue: self.config.outbound_queue,
            capacity: self.config.max_connections,
            settings: HandlerSettings {
                limits: self.limits,
                handshake_timeout: self.config.handshake_timeout(),
            },
        };
        let accept_task = tokio::spawn(acceptor.run());

        Ok(RelayHandle {
            local_addr,
            host_key,
            events: events_tx,
            state: state_rx,
            accept_task,
        })
    }

    /// Run the relay until it shuts down.
    pub async fn run(self) -> Result<()> {
        self.spawn()?.wait().await;
        Ok(())
    }
}

/// Handle to a running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    host_key: String,
    events: mpsc::Sender<RosterEvent>,
    state: watch::Receiver<ServerState>,
    accept_task: JoinHandle<()>,
}

impl RelayHandle {
    /// Address the relay accepts connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Key the host's own peer must present to claim the host name.
    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Roster snapshot, or an empty one once the relay has shut down.
    pub async fn snapshot(&self) -> RosterSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.events.send(RosterEvent::Snapshot { reply }).await.is_err() {
            return RosterSnapshot::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.snapshot().await.connection_count
    }

    /// Bound participants, sorted by username.
    pub async fn participants(&self) -> Vec<RosterEntry> {
        self.snapshot().await.entries
    }

    /// Ask the relay to shut down.
    pub async fn shutdown(&self) {
        let _ = self.events.send(RosterEvent::Shutdown).await;
    }

    /// Wait until the relay has shut down and the listener is closed.
    pub async fn wait(mut self) {
        let _ = self
            .state
            .wait_for(|s| *s == ServerState::ShuttingDown)
            .await;
        if let Err(e) = self.accept_task.await {
            error!("Accept loop ended abnormally: {}", e);
        }
    }
}

/// The accept loop.
struct Acceptor {
    listener: TcpListener,
    events: mpsc::Sender<RosterEvent>,
    state: watch::Receiver<ServerState>,
    outbound_queue: usize,
    capacity: usize,
    settings: HandlerSettings,
}

impl Acceptor {
    async fn run(mut self) {
        loop {
            let accepted = tokio::select! {
                result = self.listener.accept() => result,
                _ = self.state.wait_for(|s| *s == ServerState::ShuttingDown) => break,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    if let Err(RelayError::Shutdown) = self.admit(stream, addr).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
        info!("Relay stopped accepting connections");
    }

    /// Register a new connection with the coordinator and start its tasks,
    /// or turn it away if the relay is full.
    async fn admit(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue);
        let (close_tx, close_rx) = oneshot::channel();
        let connection = Connection::new(addr, outbound_tx, close_tx);
        let id = connection.id();

        let (reply, admitted) = oneshot::channel();
        self.events
            .send(RosterEvent::Admit { connection, reply })
            .await
            .map_err(|_| RelayError::Shutdown)?;

        match admitted.await.map_err(|_| RelayError::Shutdown)? {
            Ok(_) => {
                tokio::spawn(write_loop(
                    write_half,
                    outbound_rx,
                    addr,
                    self.settings.limits.max_frame_bytes,
                ));
                tokio::spawn(read_loop(
                    read_half,
                    id,
                    addr,
                    close_rx,
                    self.events.clone(),
                    self.settings,
                ));
                Ok(())
            }
            Err(e) => {
                let max_frame = self.settings.limits.max_frame_bytes;
                tokio::spawn(refuse(read_half, write_half, addr, self.capacity, max_frame));
                Err(e)
            }
        }
    }
}

/// Tell a connection the relay is full and order it to disconnect.
///
/// Whatever the peer already sent is drained so closing the socket does not
/// reset the connection before the notice is read.
async fn refuse(
    mut read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    addr: SocketAddr,
    capacity: usize,
    max_frame: usize,
) {
    let mut sink = FramedWrite::new(write_half, frame_codec(max_frame));
    for message in [
        capacity_notice(capacity),
        ChatMessage::system(format_info(Verb::Kick)),
    ] {
        let sent = match encode_message(&message) {
            Ok(frame) => sink.send(frame).await.map_err(RelayError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!("Could not notify refused connection {}: {}", addr, e);
            return;
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
    let mut discard = tokio::io::sink();
    let drained = timeout(REFUSAL_DRAIN, tokio::io::copy(&mut read_half, &mut discard)).await;
    debug!("Refused connection {} closed ({:?})", addr, drained.is_ok());
}
