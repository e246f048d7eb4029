//! Chat message value carried in every message frame.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Sender name used for relay-originated notices.
pub const SYSTEM_SENDER: &str = "Server";

/// Display alignment hint.
///
/// Senders mark their own messages `Right`; receivers re-derive the hint for
/// the local user with [`ChatMessage::aligned_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    Left,
    Right,
}

/// A chat message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text. May carry an embedded command.
    pub content: String,
    /// Sender's display name.
    pub sender_name: String,
    /// RFC 3339 send time.
    pub timestamp: String,
    /// Display alignment hint.
    pub alignment: Alignment,
    /// Sender's status tag ("Host", "Admin" or empty).
    pub sender_status_tag: String,
}

impl ChatMessage {
    /// Create a message authored by `sender_name`, stamped now.
    pub fn new(
        sender_name: impl Into<String>,
        content: impl Into<String>,
        status_tag: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_name: sender_name.into(),
            timestamp: Utc::now().to_rfc3339(),
            alignment: Alignment::Right,
            sender_status_tag: status_tag.into(),
        }
    }

    /// Create a relay-originated notice.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender_name: SYSTEM_SENDER.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            alignment: Alignment::Left,
            sender_status_tag: String::new(),
        }
    }

    /// Whether this notice came from the relay itself.
    pub fn is_system(&self) -> bool {
        self.sender_name == SYSTEM_SENDER && self.sender_status_tag.is_empty()
    }

    /// Return the message with its alignment set for the local user's view.
    pub fn aligned_for(mut self, local_username: &str) -> Self {
        self.alignment = if self.sender_name == local_username {
            Alignment::Right
        } else {
            Alignment::Left
        };
        self
    }

    /// Send time in local `HH:MM`, or the raw timestamp if it does not parse.
    pub fn time_of_day(&self) -> String {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
            .unwrap_or_else(|_| self.timestamp.clone())
    }

    /// Format the message for a terminal line.
    pub fn format(&self) -> String {
        if self.is_system() {
            return format!("[{}] *** {}", self.time_of_day(), self.content);
        }
        let line = if self.sender_status_tag.is_empty() {
            format!("[{}] {}: {}", self.time_of_day(), self.sender_name, self.content)
        } else {
            format!(
                "[{}] [{}] {}: {}",
                self.time_of_day(),
                self.sender_status_tag,
                self.sender_name,
                self.content
            )
        };
        match self.alignment {
            Alignment::Left => line,
            Alignment::Right => format!("{line:>60}"),
        }
    }
}
