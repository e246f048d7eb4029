//! The relay coordinator: the single task that owns the roster and the
//! shutdown countdown.
//!
//! Accept and connection tasks never touch shared state directly; they send
//! [`RosterEvent`]s here and, where they need an answer, wait on a oneshot
//! reply. Every roster mutation and every countdown arm/cancel is therefore
//! serialized through one loop.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::roster::{Connection, ConnectionId, ModerationOutcome, Roster, RosterEntry};
use crate::chat::{ChatMessage, Role};
use crate::protocol::{encode_message, format_info, parse_command, Command, Verb};
use crate::{RelayError, Result};

/// Lifecycle of a relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Bound, not yet accepting.
    Listening,
    /// Accepting and relaying.
    Running,
    /// Terminal.
    ShuttingDown,
}

/// Messages sent to the coordinator.
#[derive(Debug)]
pub(crate) enum RosterEvent {
    /// A connection was accepted and wants a slot.
    Admit {
        connection: Connection,
        reply: oneshot::Sender<Result<ConnectionId>>,
    },
    /// A connection completed its handshake.
    Bind {
        id: ConnectionId,
        username: String,
        host_key: Option<String>,
        reply: oneshot::Sender<Result<Role>>,
    },
    /// A connection sent an invalid handshake.
    Reject { id: ConnectionId, reason: String },
    /// A bound connection sent a message frame.
    Inbound {
        id: ConnectionId,
        frame: Bytes,
        message: ChatMessage,
    },
    /// A connection's peer went away.
    Disconnected { id: ConnectionId },
    /// Snapshot request.
    Snapshot {
        reply: oneshot::Sender<RosterSnapshot>,
    },
    /// Explicit shutdown request.
    Shutdown,
}

/// Point-in-time view of the roster.
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    /// Live connections, including ones still in their handshake.
    pub connection_count: usize,
    /// Bound participants, sorted by username.
    pub entries: Vec<RosterEntry>,
    /// Whether the shutdown countdown is armed.
    pub countdown_armed: bool,
}

/// Build the notice sent to a connection turned away at capacity.
pub(crate) fn capacity_notice(capacity: usize) -> ChatMessage {
    ChatMessage::system(format!(
        "The chat is full ({capacity} participants). Please try again later."
    ))
}

/// Whether the loop keeps running after an event.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Coordinator {
    roster: Roster,
    min_connections: usize,
    countdown: Duration,
    deadline: Option<Instant>,
    events: mpsc::Receiver<RosterEvent>,
    state: watch::Sender<ServerState>,
}

impl Coordinator {
    pub(crate) fn new(
        roster: Roster,
        min_connections: usize,
        countdown: Duration,
        events: mpsc::Receiver<RosterEvent>,
        state: watch::Sender<ServerState>,
    ) -> Self {
        Self {
            roster,
            min_connections,
            countdown,
            deadline: None,
            events,
            state,
        }
    }

    /// Run until the relay shuts down.
    pub(crate) async fn run(mut self) {
        self.state.send_replace(ServerState::Running);
        self.evaluate_countdown();

        loop {
            let deadline = self.deadline;
            let countdown = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if self.handle(event) == Flow::Stop {
                        break;
                    }
                }
                _ = countdown => {
                    if self.roster.len() < self.min_connections {
                        info!(
                            "Only {} of {} required participants after {:?}; shutting down",
                            self.roster.len(),
                            self.min_connections,
                            self.countdown
                        );
                        break;
                    }
                    self.deadline = None;
                }
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, event: RosterEvent) -> Flow {
        match event {
            RosterEvent::Admit { connection, reply } => {
                let _ = reply.send(self.admit(connection));
                Flow::Continue
            }
            RosterEvent::Bind {
                id,
                username,
                host_key,
                reply,
            } => {
                let _ = reply.send(self.bind(id, &username, host_key.as_deref()));
                Flow::Continue
            }
            RosterEvent::Reject { id, reason } => {
                self.turn_away(id, &reason);
                Flow::Continue
            }
            RosterEvent::Inbound { id, frame, message } => {
                self.inbound(id, frame, &message);
                Flow::Continue
            }
            RosterEvent::Disconnected { id } => self.disconnected(id),
            RosterEvent::Snapshot { reply } => {
                let _ = reply.send(RosterSnapshot {
                    connection_count: self.roster.len(),
                    entries: self.roster.entries(),
                    countdown_armed: self.deadline.is_some(),
                });
                Flow::Continue
            }
            RosterEvent::Shutdown => {
                info!("Shutdown requested");
                Flow::Stop
            }
        }
    }

    fn admit(&mut self, connection: Connection) -> Result<ConnectionId> {
        let id = connection.id();
        let addr = connection.addr();
        match self.roster.admit(connection) {
            Ok(()) => {
                debug!("Admitted {} ({}/{})", addr, self.roster.len(), self.roster.capacity());
                // Any arrival cancels a pending countdown; it restarts from
                // the full duration if the relay is still under the minimum.
                self.deadline = None;
                self.evaluate_countdown();
                Ok(id)
            }
            Err(_) => {
                info!("Refusing {}: relay is at capacity", addr);
                Err(RelayError::ConnectionRefused(format!(
                    "capacity of {} reached",
                    self.roster.capacity()
                )))
            }
        }
    }

    fn bind(&mut self, id: ConnectionId, username: &str, host_key: Option<&str>) -> Result<Role> {
        match self.roster.bind(id, username, host_key) {
            Ok(role) => {
                info!("{} joined as {}", username, role);
                self.announce(format!("{username} joined the chat"));
                Ok(role)
            }
            Err(e) => {
                self.turn_away(id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Notify a connection that its handshake failed, then drop it.
    fn turn_away(&mut self, id: ConnectionId, reason: &str) {
        let Some(connection) = self.roster.remove(id) else {
            return;
        };
        warn!("Turning away {}: {}", connection.addr(), reason);
        for message in [
            ChatMessage::system(format!("Connection refused: {reason}")),
            ChatMessage::system(format_info(Verb::Kick)),
        ] {
            if let Err(e) = encode_message(&message).and_then(|frame| connection.send(frame)) {
                debug!("Could not notify {}: {}", connection.addr(), e);
            }
        }
        drop(connection);
        self.evaluate_countdown();
    }

    fn inbound(&mut self, id: ConnectionId, frame: Bytes, message: &ChatMessage) {
        let Some(sender) = self.roster.get(id) else {
            return;
        };
        let sender_name = sender.username().unwrap_or_default().to_string();

        match parse_command(&message.content) {
            Some(Command::Info(verb)) => {
                debug!("Ignoring {} envelope sent by client {}", verb, sender_name);
            }
            Some(Command::Moderate {
                verb,
                requester,
                target,
            }) => {
                if requester != sender_name {
                    debug!("{} sent {} on behalf of {}", sender_name, verb, requester);
                }
                self.moderate(id, &requester, verb, &target);
            }
            None => {
                self.roster.broadcast(&frame);
            }
        }
    }

    /// Apply a command. Rejections go back to the connection that sent it.
    fn moderate(&mut self, sender: ConnectionId, requester_name: &str, verb: Verb, target: &str) {
        match self.roster.moderate(requester_name, verb, target) {
            ModerationOutcome::TargetNotFound => {
                debug!("{} {} {}: no such participant", requester_name, verb, target);
            }
            ModerationOutcome::Denied {
                requester: requester_role,
                target: target_role,
            } => {
                let denied = RelayError::AuthorizationDenied(format!(
                    "{requester_name} ({requester_role}) may not {verb} {target} ({target_role})"
                ));
                warn!("{}", denied);
                let action = verb.as_str().to_lowercase();
                self.send_notice(
                    sender,
                    format!("Command rejected: you may not {action} {target}"),
                );
            }
            ModerationOutcome::MuteToggled {
                target: target_id,
                name,
                muted,
            } => {
                self.send_notice(target_id, format_info(Verb::Mute));
                if muted {
                    self.announce(format!("{name} has been muted"));
                } else {
                    self.announce(format!("{name} has been unmuted"));
                }
            }
            ModerationOutcome::AdminToggled {
                target: target_id,
                name,
                admin,
            } => {
                self.send_notice(target_id, format_info(Verb::Admin));
                if admin {
                    self.announce(format!("{name} is now an admin"));
                } else {
                    self.announce(format!("{name} is no longer an admin"));
                }
            }
            ModerationOutcome::Kicked { name, connection } => {
                info!("{} kicked {}", requester_name, name);
                let kick = ChatMessage::system(format_info(Verb::Kick));
                if let Err(e) = encode_message(&kick).and_then(|frame| connection.send(frame)) {
                    debug!("Could not deliver kick notice to {}: {}", name, e);
                }
                drop(connection);
                self.announce(format!("{name} has been kicked"));
                self.evaluate_countdown();
            }
        }
    }

    fn disconnected(&mut self, id: ConnectionId) -> Flow {
        // Already gone if it was kicked or turned away.
        let Some(connection) = self.roster.remove(id) else {
            return Flow::Continue;
        };
        let flow = match (connection.username(), connection.role()) {
            (Some(name), Role::Host) => {
                info!("Host {} disconnected", name);
                self.announce(format!("Host {name} disconnected. The chat has ended."));
                Flow::Stop
            }
            (Some(name), _) => {
                info!("{} disconnected", name);
                self.announce(format!("{name} disconnected"));
                Flow::Continue
            }
            (None, _) => {
                debug!("{} left before completing the handshake", connection.addr());
                Flow::Continue
            }
        };
        drop(connection);
        if flow == Flow::Continue {
            self.evaluate_countdown();
        }
        flow
    }

    /// Arm the countdown if under-populated and not armed; cancel it once
    /// the minimum is met.
    ///
    /// `admit` clears the deadline before calling this, so each new
    /// connection that leaves the relay below the minimum restarts the
    /// countdown from its full duration.
    fn evaluate_countdown(&mut self) {
        if self.roster.len() >= self.min_connections {
            if self.deadline.take().is_some() {
                debug!("Shutdown countdown cancelled");
            }
        } else if self.deadline.is_none() {
            debug!(
                "{} of {} participants; shutdown in {:?}",
                self.roster.len(),
                self.min_connections,
                self.countdown
            );
            self.deadline = Some(Instant::now() + self.countdown);
        }
    }

    fn send_notice(&self, id: ConnectionId, content: String) {
        let message = ChatMessage::system(content);
        if let Err(e) = encode_message(&message).and_then(|frame| self.roster.send_to(id, frame)) {
            warn!("Private notice to {} failed: {}", id, e);
        }
    }

    fn announce(&self, content: String) {
        match encode_message(&ChatMessage::system(content)) {
            Ok(frame) => {
                self.roster.broadcast(&frame);
            }
            Err(e) => warn!("Could not encode announcement: {}", e),
        }
    }

    fn shutdown(&mut self) {
        info!("Relay shutting down ({} connections)", self.roster.len());
        self.state.send_replace(ServerState::ShuttingDown);
        self.deadline = None;
        self.roster.clear();
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_message;
    use std::net::SocketAddr;

    struct TestPeer {
        id: ConnectionId,
        outbound: mpsc::Receiver<Bytes>,
        _closed: oneshot::Receiver<()>,
    }

    impl TestPeer {
        fn drain(&mut self) -> Vec<String> {
            let mut contents = Vec::new();
            while let Ok(frame) = self.outbound.try_recv() {
                contents.push(decode_message(&frame).unwrap().content);
            }
            contents
        }
    }

    fn coordinator(host: &str, capacity: usize, min: usize) -> Coordinator {
        let (_tx, rx) = mpsc::channel(8);
        let (state, _) = watch::channel(ServerState::Listening);
        Coordinator::new(
            Roster::new(host, capacity),
            min,
            Duration::from_secs(30),
            rx,
            state,
        )
    }

    fn connect(coord: &mut Coordinator, port: u16) -> (Result<ConnectionId>, TestPeer) {
        let (tx, rx) = mpsc::channel(16);
        let (close_tx, close_rx) = oneshot::channel();
        let conn = Connection::new(SocketAddr::from(([127, 0, 0, 1], port)), tx, close_tx);
        let id = conn.id();
        let result = coord.admit(conn);
        (
            result,
            TestPeer {
                id,
                outbound: rx,
                _closed: close_rx,
            },
        )
    }

    fn join(coord: &mut Coordinator, port: u16, name: &str) -> TestPeer {
        let (result, peer) = connect(coord, port);
        result.unwrap();
        coord.bind(peer.id, name, None).unwrap();
        peer
    }

    fn say(coord: &mut Coordinator, peer: &TestPeer, name: &str, text: &str) {
        let message = ChatMessage::new(name, text, "");
        let frame = encode_message(&message).unwrap();
        coord.inbound(peer.id, frame, &message);
    }

    #[test]
    fn test_countdown_armed_when_under_populated() {
        let mut coord = coordinator("Alice", 5, 2);
        coord.evaluate_countdown();
        assert!(coord.deadline.is_some());

        let _alice = join(&mut coord, 1, "Alice");
        assert!(coord.deadline.is_some());

        let _bob = join(&mut coord, 2, "Bob");
        assert!(coord.deadline.is_none());
    }

    #[test]
    fn test_new_connection_restarts_pending_countdown() {
        let mut coord = coordinator("Alice", 5, 3);
        coord.evaluate_countdown();
        let first = coord.deadline.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let _alice = join(&mut coord, 1, "Alice");
        let second = coord.deadline.unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_disconnect_rearms_countdown() {
        let mut coord = coordinator("Alice", 5, 2);
        let _alice = join(&mut coord, 1, "Alice");
        let bob = join(&mut coord, 2, "Bob");
        assert!(coord.deadline.is_none());

        assert_eq!(coord.disconnected(bob.id), Flow::Continue);
        assert!(coord.deadline.is_some());
    }

    #[test]
    fn test_zero_minimum_never_arms() {
        let mut coord = coordinator("Alice", 5, 0);
        coord.evaluate_countdown();
        assert!(coord.deadline.is_none());
    }

    #[test]
    fn test_capacity_refusal() {
        let mut coord = coordinator("Alice", 2, 0);
        let _alice = join(&mut coord, 1, "Alice");
        let _bob = join(&mut coord, 2, "Bob");

        let (result, _carol) = connect(&mut coord, 3);
        assert!(matches!(result, Err(RelayError::ConnectionRefused(_))));
        assert_eq!(coord.roster.len(), 2);
    }

    #[test]
    fn test_join_is_announced() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        let _bob = join(&mut coord, 2, "Bob");
        assert_eq!(
            alice.drain(),
            vec!["Alice joined the chat", "Bob joined the chat"]
        );
    }

    #[test]
    fn test_duplicate_name_is_turned_away() {
        let mut coord = coordinator("Alice", 5, 0);
        let _bob = join(&mut coord, 1, "Bob");
        let (result, mut imposter) = connect(&mut coord, 2);
        result.unwrap();

        assert!(coord.bind(imposter.id, "Bob", None).is_err());
        assert!(coord.roster.get(imposter.id).is_none());
        let notices = imposter.drain();
        assert!(notices[0].starts_with("Connection refused"));
        assert_eq!(notices[1], "<INFO>|KICK|<INFO>");
    }

    #[test]
    fn test_chat_broadcast_verbatim() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        let mut bob = join(&mut coord, 2, "Bob");
        alice.drain();
        bob.drain();

        say(&mut coord, &bob, "Bob", "hello <everyone>|or|not");
        assert_eq!(alice.drain(), vec!["hello <everyone>|or|not"]);
        assert_eq!(bob.drain(), vec!["hello <everyone>|or|not"]);
    }

    #[test]
    fn test_client_info_envelope_ignored() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        let bob = join(&mut coord, 2, "Bob");
        alice.drain();

        say(&mut coord, &bob, "Bob", "<INFO>|ADMIN|<INFO>");
        assert!(alice.drain().is_empty());
        assert_eq!(coord.roster.find("Bob").unwrap().role(), Role::Regular);
    }

    #[test]
    fn test_host_mutes_regular() {
        let mut coord = coordinator("Alice", 5, 2);
        let mut alice = join(&mut coord, 1, "Alice");
        let mut bob = join(&mut coord, 2, "Bob");
        alice.drain();
        bob.drain();

        say(&mut coord, &alice, "Alice", "<Alice>|MUTE|<Bob>");
        assert_eq!(bob.drain(), vec!["<INFO>|MUTE|<INFO>", "Bob has been muted"]);
        assert_eq!(alice.drain(), vec!["Bob has been muted"]);
    }

    #[test]
    fn test_requester_role_follows_named_requester() {
        let mut coord = coordinator("Alice", 5, 2);
        let mut alice = join(&mut coord, 1, "Alice");
        let mut bob = join(&mut coord, 2, "Bob");
        alice.drain();
        bob.drain();

        say(&mut coord, &bob, "Bob", "<Alice>|MUTE|<Bob>");
        assert_eq!(bob.drain(), vec!["<INFO>|MUTE|<INFO>", "Bob has been muted"]);
        assert_eq!(alice.drain(), vec!["Bob has been muted"]);
        assert!(coord.roster.find("Bob").unwrap().is_muted());
    }

    #[test]
    fn test_rejection_goes_to_sender() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        let mut bob = join(&mut coord, 2, "Bob");
        let mut carol = join(&mut coord, 3, "Carol");
        alice.drain();
        bob.drain();
        carol.drain();

        say(&mut coord, &bob, "Bob", "<Carol>|KICK|<Alice>");
        let replies = bob.drain();
        assert_eq!(replies, vec!["Command rejected: you may not kick Alice"]);
        assert!(carol.drain().is_empty());
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn test_admin_cannot_kick_host() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        let _bob = join(&mut coord, 2, "Bob");
        let mut carol = join(&mut coord, 3, "Carol");
        say(&mut coord, &alice, "Alice", "<Alice>|ADMIN|<Carol>");
        alice.drain();
        carol.drain();

        say(&mut coord, &carol, "Carol", "<Carol>|KICK|<Alice>");
        let replies = carol.drain();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("Command rejected"));
        assert!(alice.drain().is_empty());
        assert_eq!(coord.roster.find("Alice").unwrap().role(), Role::Host);
    }

    #[test]
    fn test_kick_notifies_then_removes() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        let mut bob = join(&mut coord, 2, "Bob");
        alice.drain();
        bob.drain();

        say(&mut coord, &alice, "Alice", "<Alice>|KICK|<Bob>");
        assert_eq!(bob.drain(), vec!["<INFO>|KICK|<INFO>"]);
        assert_eq!(alice.drain(), vec!["Bob has been kicked"]);
        assert!(coord.roster.find("Bob").is_none());

        // The handler's late disconnect is a no-op.
        assert_eq!(coord.disconnected(bob.id), Flow::Continue);
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn test_moderating_missing_target_is_silent() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        alice.drain();

        say(&mut coord, &alice, "Alice", "<Alice>|MUTE|<Ghost>");
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn test_host_disconnect_stops() {
        let mut coord = coordinator("Alice", 5, 0);
        let alice = join(&mut coord, 1, "Alice");
        let mut bob = join(&mut coord, 2, "Bob");
        bob.drain();

        assert_eq!(coord.disconnected(alice.id), Flow::Stop);
        assert_eq!(
            bob.drain(),
            vec!["Host Alice disconnected. The chat has ended."]
        );
    }

    #[test]
    fn test_regular_disconnect_is_announced() {
        let mut coord = coordinator("Alice", 5, 0);
        let mut alice = join(&mut coord, 1, "Alice");
        let bob = join(&mut coord, 2, "Bob");
        alice.drain();

        assert_eq!(coord.disconnected(bob.id), Flow::Continue);
        assert_eq!(alice.drain(), vec!["Bob disconnected"]);
    }

    #[test]
    fn test_shutdown_clears_roster() {
        let mut coord = coordinator("Alice", 5, 0);
        let _alice = join(&mut coord, 1, "Alice");
        let mut state = coord.state.subscribe();

        coord.shutdown();
        assert!(coord.roster.is_empty());
        assert_eq!(*state.borrow_and_update(), ServerState::ShuttingDown);
    }
}
