//! Moderation command grammar embedded in message text.
//!
//! Client to relay: `<requester>|VERB|<target>`.
//! Relay to a single client: `<INFO>|VERB|<INFO>`.
//!
//! Text is parsed once into a [`Command`]; anything that does not match
//! either form exactly is ordinary chat.

/// Literal that fills both name slots of a relay-to-client push.
pub const INFO_MARKER: &str = "INFO";

const SEPARATOR: char = '|';

/// Moderation verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Toggle the target's muted flag.
    Mute,
    /// Toggle the target between regular and admin.
    Admin,
    /// Remove the target from the chat.
    Kick,
}

impl Verb {
    /// Wire spelling of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Mute => "MUTE",
            Verb::Admin => "ADMIN",
            Verb::Kick => "KICK",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "MUTE" => Some(Verb::Mute),
            "ADMIN" => Some(Verb::Admin),
            "KICK" => Some(Verb::Kick),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Private status push from the relay (`<INFO>|VERB|<INFO>`).
    Info(Verb),
    /// Moderation request (`<requester>|VERB|<target>`).
    Moderate {
        verb: Verb,
        requester: String,
        target: String,
    },
}

/// Strip the angle brackets around a name slot.
fn bracketed(slot: &str) -> Option<&str> {
    let inner = slot.strip_prefix('<')?.strip_suffix('>')?;
    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

/// Parse message text into a command, or `None` for ordinary chat.
pub fn parse_command(text: &str) -> Option<Command> {
    let mut parts = text.trim().split(SEPARATOR);
    let (first, verb, last) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let verb = Verb::from_wire(verb)?;
    let requester = bracketed(first)?;
    let target = bracketed(last)?;

    // The echo form is recognized before the request form.
    if requester == INFO_MARKER && target == INFO_MARKER {
        return Some(Command::Info(verb));
    }

    Some(Command::Moderate {
        verb,
        requester: requester.to_string(),
        target: target.to_string(),
    })
}

/// Format a moderation request.
pub fn format_request(requester: &str, verb: Verb, target: &str) -> String {
    format!("<{requester}>{SEPARATOR}{verb}{SEPARATOR}<{target}>")
}

/// Format a private status push.
pub fn format_info(verb: Verb) -> String {
    format_request(INFO_MARKER, verb, INFO_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moderation_requests() {
        assert_eq!(
            parse_command("<Alice>|MUTE|<Bob>"),
            Some(Command::Moderate {
                verb: Verb::Mute,
                requester: "Alice".to_string(),
                target: "Bob".to_string(),
            })
        );
        assert_eq!(
            parse_command("<Carol>|KICK|<Alice>"),
            Some(Command::Moderate {
                verb: Verb::Kick,
                requester: "Carol".to_string(),
                target: "Alice".to_string(),
            })
        );
        assert!(matches!(
            parse_command("<Alice>|ADMIN|<Dave Smith>"),
            Some(Command::Moderate { verb: Verb::Admin, ref target, .. }) if target == "Dave Smith"
        ));
    }

    #[test]
    fn test_parse_info_envelope() {
        assert_eq!(parse_command("<INFO>|MUTE|<INFO>"), Some(Command::Info(Verb::Mute)));
        assert_eq!(parse_command("<INFO>|ADMIN|<INFO>"), Some(Command::Info(Verb::Admin)));
        assert_eq!(parse_command("<INFO>|KICK|<INFO>"), Some(Command::Info(Verb::Kick)));
    }

    #[test]
    fn test_half_info_is_a_request() {
        assert!(matches!(
            parse_command("<INFO>|KICK|<Bob>"),
            Some(Command::Moderate { .. })
        ));
    }

    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        assert_eq!(parse_command("  <INFO>|KICK|<INFO>\n"), Some(Command::Info(Verb::Kick)));
    }

    #[test]
    fn test_near_misses_are_chat() {
        for text in [
            "hello there",
            "",
            "<Alice>|mute|<Bob>",
            "<Alice>|BAN|<Bob>",
            "Alice|MUTE|Bob",
            "<Alice>|MUTE|Bob",
            "<>|MUTE|<Bob>",
            "<Alice>|MUTE|<Bob>|extra",
            "<Alice>|MUTE",
            "<Alice> | MUTE | <Bob>",
            "a | b | c",
        ] {
            assert_eq!(parse_command(text), None, "{text:?} should be chat");
        }
    }

    #[test]
    fn test_format_request() {
        assert_eq!(format_request("Alice", Verb::Mute, "Bob"), "<Alice>|MUTE|<Bob>");
        assert_eq!(format_info(Verb::Kick), "<INFO>|KICK|<INFO>");
    }

    #[test]
    fn test_formatted_request_parses_back() {
        for verb in [Verb::Mute, Verb::Admin, Verb::Kick] {
            assert_eq!(parse_command(&format_info(verb)), Some(Command::Info(verb)));
        }
    }
}
