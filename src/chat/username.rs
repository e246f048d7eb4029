//! Username validation for the handshake.

use crate::protocol::INFO_MARKER;

/// Characters that would make a name ambiguous inside the command grammar.
const RESERVED_CHARS: &[char] = &['|', '<', '>'];

/// Validate a handshake username and return it trimmed.
///
/// `max_bytes` bounds the encoded length of the trimmed name.
pub fn validate_username(raw: &str, max_bytes: usize) -> Result<&str, String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err("username is empty".to_string());
    }
    if name.len() > max_bytes {
        return Err(format!("username exceeds {max_bytes} bytes"));
    }
    if name.chars().any(|c| RESERVED_CHARS.contains(&c) || c.is_control()) {
        return Err("username contains reserved characters".to_string());
    }
    if name.eq_ignore_ascii_case(INFO_MARKER) {
        return Err(format!("username '{name}' is reserved"));
    }
    Ok(name)
}
