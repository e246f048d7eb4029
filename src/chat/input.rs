//! Local input parser for the terminal front-end.
//!
//! Lines starting with `/` are local commands (`/mute`, `/admin`, `/kick`,
//! `/status`, `/help`, `/quit`); everything else is chat text.

/// Result of parsing a line typed by the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    /// Text to send as chat.
    Message(String),
    /// Parsed local command.
    Command(LocalCommand),
}

/// A parsed local command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    /// Leave the session.
    Quit,
    /// Toggle mute on a participant.
    Mute(String),
    /// Toggle admin on a participant.
    Admin(String),
    /// Remove a participant.
    Kick(String),
    /// Show the local status flags.
    Status,
    /// Show help.
    Help,
    /// Unknown command, or a moderation command without a target.
    Unknown(String),
}

/// Parse a line of local input.
pub fn parse_input(input: &str) -> ChatInput {
    let trimmed = input.trim();

    let Some(without_slash) = trimmed.strip_prefix('/') else {
        return ChatInput::Message(trimmed.to_string());
    };

    let (cmd, args) = match without_slash.find(' ') {
        Some(pos) => (&without_slash[..pos], without_slash[pos + 1..].trim()),
        None => (without_slash, ""),
    };

    let command = match cmd.to_lowercase().as_str() {
        "quit" | "q" | "exit" => LocalCommand::Quit,
        "mute" => with_target(cmd, args, LocalCommand::Mute),
        "admin" | "op" => with_target(cmd, args, LocalCommand::Admin),
        "kick" => with_target(cmd, args, LocalCommand::Kick),
        "status" => LocalCommand::Status,
        "help" | "h" | "?" => LocalCommand::Help,
        _ => LocalCommand::Unknown(cmd.to_string()),
    };

    ChatInput::Command(command)
}

fn with_target(cmd: &str, args: &str, make: fn(String) -> LocalCommand) -> LocalCommand {
    if args.is_empty() {
        LocalCommand::Unknown(cmd.to_string())
    } else {
        make(args.to_string())
    }
}

/// Format the help text.
pub fn format_help() -> String {
    [
        "=== Commands ===",
        "/mute <name>   toggle mute on a participant",
        "/admin <name>  toggle admin on a participant",
        "/kick <name>   remove a participant",
        "/status        show your status",
        "/help          show this help",
        "/quit          leave the chat",
    ]
    .join("\n")
}
