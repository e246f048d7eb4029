//! chatrelay - peer-hosted chat relay
//!
//! One participant hosts a relay server that every participant, the host
//! included, connects to. The relay forwards chat, enforces the host/admin/
//! regular role hierarchy for mute, admin and kick commands, limits the
//! number of connections, and shuts down when the host leaves or the chat
//! stays under-populated.

pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;

pub use chat::{ChatMessage, PeerStatus, Role};
pub use client::{PeerConnection, PeerEvent};
pub use config::Config;
pub use error::{RelayError, Result};
pub use server::{RelayHandle, RelayServer, ServerState};
