//! Client side of the relay.
//!
//! Every participant, the host included, talks to the relay through a
//! [`PeerConnection`]. Inbound messages and local status changes are raised
//! as [`PeerEvent`]s on the channel returned by [`PeerConnection::connect`].

mod connection;

pub use connection::{PeerConnection, PeerEvent};
