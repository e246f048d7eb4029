//! Per-connection reader and writer tasks.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::coordinator::RosterEvent;
use super::roster::ConnectionId;
use crate::config::LimitsConfig;
use crate::protocol::{
    decode_handshake, decode_message, frame_codec, handshake_frame_limit, is_disconnect, Handshake,
};

/// Settings a connection handler needs from the relay configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandlerSettings {
    pub limits: LimitsConfig,
    pub handshake_timeout: Duration,
}

/// Drain the outbound queue onto the socket.
///
/// Ends when the roster drops the queue sender, after flushing what was
/// already queued, and then shuts down the write half.
pub(crate) async fn write_loop(
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    addr: SocketAddr,
    max_frame_bytes: usize,
) {
    let mut sink = FramedWrite::new(write_half, frame_codec(max_frame_bytes));
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!("Write to {} failed: {}", addr, e);
            return;
        }
    }
    if let Err(e) = SinkExt::<Bytes>::close(&mut sink).await {
        debug!("Closing {} failed: {}", addr, e);
    }
}

/// Read the handshake, then relay frames to the coordinator until the peer
/// disconnects or the relay closes this connection.
pub(crate) async fn read_loop(
    read_half: OwnedReadHalf,
    id: ConnectionId,
    addr: SocketAddr,
    mut closed: oneshot::Receiver<()>,
    events: mpsc::Sender<RosterEvent>,
    settings: HandlerSettings,
) {
    let codec = frame_codec(handshake_frame_limit(settings.limits.max_handshake_bytes));
    let mut frames = FramedRead::new(read_half, codec);

    let handshake = tokio::select! {
        _ = &mut closed => return,
        result = timeout(settings.handshake_timeout, frames.next()) => result,
    };

    let handshake = match handshake {
        Err(_) => Err("handshake timed out".to_string()),
        Ok(None) => {
            let _ = events.send(RosterEvent::Disconnected { id }).await;
            return;
        }
        Ok(Some(Ok(frame))) if is_disconnect(&frame) => {
            let _ = events.send(RosterEvent::Disconnected { id }).await;
            return;
        }
        Ok(Some(Ok(frame))) => decode_handshake(&frame, settings.limits.max_handshake_bytes)
            .map_err(|e| e.to_string()),
        Ok(Some(Err(e))) => Err(format!("bad handshake frame: {e}")),
    };

    let Handshake { username, host_key } = match handshake {
        Ok(handshake) => handshake,
        Err(reason) => {
            let _ = events.send(RosterEvent::Reject { id, reason }).await;
            return;
        }
    };

    let (reply, bound) = oneshot::channel();
    let bind = RosterEvent::Bind {
        id,
        username: username.clone(),
        host_key,
        reply,
    };
    if events.send(bind).await.is_err() {
        return;
    }
    match bound.await {
        Ok(Ok(_role)) => {}
        // Turned away or the relay is gone; either way this connection is finished.
        _ => return,
    }

    frames
        .decoder_mut()
        .set_max_frame_length(settings.limits.max_frame_bytes);

    loop {
        tokio::select! {
            _ = &mut closed => {
                debug!("Connection {} ({}) closed by relay", username, addr);
                return;
            }
            next = frames.next() => match next {
                None => break,
                Some(Ok(frame)) if is_disconnect(&frame) => break,
                Some(Ok(frame)) => {
                    let frame = frame.freeze();
                    match decode_message(&frame) {
                        Ok(message) => {
                            let inbound = RosterEvent::Inbound { id, frame, message };
                            if events.send(inbound).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping frame from {}: {}", username, e),
                    }
                }
                Some(Err(e)) => {
                    warn!("Read from {} ({}) failed: {}", username, addr, e);
                    break;
                }
            }
        }
    }

    let _ = events.send(RosterEvent::Disconnected { id }).await;
}
