//! Frame codec shared by relay and peers.
//!
//! Every frame is a 4-byte big-endian length followed by the payload. The
//! handshake payload is the raw UTF-8 username, followed by a newline and the
//! relay's host key when the host's own client connects. Message payloads are
//! JSON [`ChatMessage`]s. A zero-length frame is the disconnect sentinel.

use bytes::Bytes;
use tokio_util::codec::LengthDelimitedCodec;

use crate::chat::{validate_username, ChatMessage};
use crate::{RelayError, Result};

/// Payload of the disconnect sentinel frame.
pub const DISCONNECT_SENTINEL: Bytes = Bytes::new();

/// Build a length-delimited codec bounded to `max_frame_bytes`.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Whether a received frame is the disconnect sentinel.
pub fn is_disconnect(frame: &[u8]) -> bool {
    frame.is_empty()
}

/// Encode a message payload.
pub fn encode_message(message: &ChatMessage) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a message payload.
pub fn decode_message(frame: &[u8]) -> Result<ChatMessage> {
    serde_json::from_slice(frame).map_err(|e| RelayError::Protocol(format!("bad message frame: {e}")))
}

/// Length of a host key in bytes.
pub const HOST_KEY_BYTES: usize = 32;

const HOST_KEY_SEPARATOR: char = '\n';

/// A decoded handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub username: String,
    /// Key proving the connection belongs to the relay's host.
    pub host_key: Option<String>,
}

/// Largest handshake frame accepted for a username limit of `max_username_bytes`.
pub fn handshake_frame_limit(max_username_bytes: usize) -> usize {
    max_username_bytes + HOST_KEY_SEPARATOR.len_utf8() + HOST_KEY_BYTES
}

/// Encode the handshake payload.
pub fn encode_handshake(username: &str, host_key: Option<&str>) -> Bytes {
    match host_key {
        Some(key) => Bytes::from(format!("{username}{HOST_KEY_SEPARATOR}{key}")),
        None => Bytes::copy_from_slice(username.as_bytes()),
    }
}

/// Decode and validate the handshake payload.
pub fn decode_handshake(frame: &[u8], max_bytes: usize) -> Result<Handshake> {
    if frame.len() > handshake_frame_limit(max_bytes) {
        return Err(RelayError::Handshake(format!(
            "handshake exceeds {max_bytes} bytes"
        )));
    }
    let raw = std::str::from_utf8(frame)
        .map_err(|_| RelayError::Handshake("username is not valid UTF-8".to_string()))?;
    let (name, host_key) = match raw.trim().split_once(HOST_KEY_SEPARATOR) {
        Some((name, key)) => (name, Some(key.trim())),
        None => (raw, None),
    };

    if let Some(key) = host_key {
        if key.len() != HOST_KEY_BYTES || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RelayError::Handshake("malformed host key".to_string()));
        }
    }
    let username = validate_username(name, max_bytes).map_err(RelayError::Handshake)?;

    Ok(Handshake {
        username: username.to_string(),
        host_key: host_key.map(str::to_string),
    })
}
