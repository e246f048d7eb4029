//! Peer connection into a relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::chat::{validate_username, ChatMessage, PeerStatus};
use crate::config::LimitsConfig;
use crate::protocol::{
    decode_message, encode_handshake, encode_message, format_request, frame_codec,
    handshake_frame_limit, is_disconnect, parse_command, Command, Verb, DISCONNECT_SENTINEL,
};
use crate::{RelayError, Result};

/// Events raised to the session coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A display message arrived.
    MessageReceived(ChatMessage),
    /// The local status flags changed.
    StatusChanged(PeerStatus),
}

type FrameSink = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// State shared between the connection handle and its receive loop.
struct Shared {
    username: String,
    is_host: bool,
    admin: AtomicBool,
    muted: AtomicBool,
    connected: AtomicBool,
    max_frame_bytes: usize,
    writer: Mutex<Option<FrameSink>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Shared {
    fn status(&self) -> PeerStatus {
        PeerStatus {
            is_host: self.is_host,
            is_admin: self.admin.load(Ordering::SeqCst),
            is_muted: self.muted.load(Ordering::SeqCst),
            is_connected: self.connected.load(Ordering::SeqCst),
        }
    }

    fn emit_status(&self) {
        let _ = self.events.send(PeerEvent::StatusChanged(self.status()));
    }

    /// Clear the connected flag and close the write half.
    /// Emits `StatusChanged` only on the first call.
    async fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = SinkExt::<Bytes>::close(&mut sink).await;
        }
        if was_connected {
            info!("{} disconnected from relay", self.username);
            self.emit_status();
        }
    }
}

/// A participant's connection into the relay. The host uses one too.
pub struct PeerConnection {
    shared: Arc<Shared>,
    receiver: JoinHandle<()>,
}

impl PeerConnection {
    /// Connect to the relay at `addr` and perform the username handshake.
    ///
    /// The host's own peer passes the relay's host key; guests pass `None`.
    /// Returns the connection and the receiver for its events.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: &str,
        host_key: Option<&str>,
        limits: LimitsConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let username = validate_username(username, limits.max_handshake_bytes)
            .map_err(RelayError::Handshake)?
            .to_string();

        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let max_frame = limits
            .max_frame_bytes
            .max(handshake_frame_limit(limits.max_handshake_bytes));
        let mut sink = FramedWrite::new(write_half, frame_codec(max_frame));
        sink.send(encode_handshake(&username, host_key)).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            username,
            is_host: host_key.is_some(),
            admin: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            max_frame_bytes: limits.max_frame_bytes,
            writer: Mutex::new(Some(sink)),
            events: events_tx,
        });

        let frames = FramedRead::new(read_half, frame_codec(limits.max_frame_bytes));
        let receiver = tokio::spawn(receive_loop(frames, Arc::clone(&shared)));

        info!("{} connected to relay at {}", shared.username, peer_addr);
        shared.emit_status();

        Ok((Self { shared, receiver }, events_rx))
    }

    /// Local username.
    pub fn username(&self) -> &str {
        &self.shared.username
    }

    /// Local connected flag. No liveness probing.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of the local status flags.
    pub fn status(&self) -> PeerStatus {
        self.shared.status()
    }

    /// Send chat text. Refused locally while muted.
    pub async fn send(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        if self.shared.muted.load(Ordering::SeqCst) && parse_command(text).is_none() {
            return Err(RelayError::Muted);
        }
        self.write_text(text).await
    }

    /// Ask the relay to toggle mute on `target`.
    pub async fn attempt_mute(&self, target: &str) -> Result<()> {
        self.send_command(Verb::Mute, target).await
    }

    /// Ask the relay to toggle admin on `target`.
    pub async fn attempt_admin(&self, target: &str) -> Result<()> {
        self.send_command(Verb::Admin, target).await
    }

    /// Ask the relay to remove `target`.
    pub async fn attempt_kick(&self, target: &str) -> Result<()> {
        self.send_command(Verb::Kick, target).await
    }

    async fn send_command(&self, verb: Verb, target: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let text = format_request(&self.shared.username, verb, target);
        self.write_text(&text).await
    }

    async fn write_text(&self, text: &str) -> Result<()> {
        let tag = self.status().role().status_tag();
        let message = ChatMessage::new(self.shared.username.as_str(), text, tag);
        self.write_frame(encode_message(&message)?).await
    }

    /// Write one frame. Only transport failures close the connection.
    async fn write_frame(&self, frame: Bytes) -> Result<()> {
        if frame.len() > self.shared.max_frame_bytes {
            return Err(RelayError::MessageTooLarge {
                size: frame.len(),
                max: self.shared.max_frame_bytes,
            });
        }
        let mut writer = self.shared.writer.lock().await;
        let sink = writer.as_mut().ok_or(RelayError::NotConnected)?;
        if let Err(e) = sink.send(frame).await {
            warn!("Send from {} failed: {}", self.shared.username, e);
            drop(writer);
            self.shared.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send the disconnect sentinel and close the connection.
    pub async fn disconnect(&self) {
        {
            let mut writer = self.shared.writer.lock().await;
            if let Some(sink) = writer.as_mut() {
                if let Err(e) = sink.send(DISCONNECT_SENTINEL).await {
                    debug!("Could not send disconnect sentinel: {}", e);
                }
            }
        }
        self.shared.close().await;
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Read frames until the relay goes away or kicks us.
async fn receive_loop(
    mut frames: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    shared: Arc<Shared>,
) {
    while let Some(next) = frames.next().await {
        let frame = match next {
            Ok(frame) if is_disconnect(&frame) => break,
            Ok(frame) => frame,
            Err(e) => {
                warn!("Receive for {} failed: {}", shared.username, e);
                break;
            }
        };

        let message = match decode_message(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Receive for {} failed: {}", shared.username, e);
                break;
            }
        };

        match parse_command(&message.content) {
            Some(Command::Info(Verb::Mute)) => {
                let muted = !shared.muted.fetch_xor(true, Ordering::SeqCst);
                debug!("{} muted={}", shared.username, muted);
                shared.emit_status();
            }
            Some(Command::Info(Verb::Admin)) => {
                let admin = !shared.admin.fetch_xor(true, Ordering::SeqCst);
                debug!("{} admin={}", shared.username, admin);
                shared.emit_status();
            }
            Some(Command::Info(Verb::Kick)) => {
                info!("{} was removed by the relay", shared.username);
                break;
            }
            _ => {
                let message = message.aligned_for(&shared.username);
                let _ = shared.events.send(PeerEvent::MessageReceived(message));
            }
        }
    }

    shared.close().await;
}
