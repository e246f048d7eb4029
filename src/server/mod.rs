//! Relay server module.
//!
//! The relay accepts peer connections up to a capacity, keeps the roster of
//! participants and their roles, relays chat, applies moderation commands,
//! and shuts itself down when the host leaves or the chat stays
//! under-populated for the configured countdown.

mod connection;
mod coordinator;
mod listener;
mod roster;

pub use coordinator::{RosterSnapshot, ServerState};
pub use listener::{RelayHandle, RelayServer};
pub use roster::{Connection, ConnectionId, ModerationOutcome, Roster, RosterEntry};
