//! Chat domain types for chatrelay.
//!
//! This module provides:
//! - The wire message value ([`ChatMessage`]) and its display alignment
//! - Participant roles and the moderation rule ([`Role::can_moderate`])
//! - Handshake username validation
//! - The local input parser used by the terminal front-end

mod input;
mod message;
mod role;
mod username;

pub use input::{format_help, parse_input, ChatInput, LocalCommand};
pub use message::{Alignment, ChatMessage, SYSTEM_SENDER};
pub use role::{PeerStatus, Role};
pub use username::validate_username;
