//! Wire protocol: framing and the embedded command grammar.

mod codec;
mod command;

pub use codec::{
    decode_handshake, decode_message, encode_handshake, encode_message, frame_codec,
    handshake_frame_limit, is_disconnect, Handshake, DISCONNECT_SENTINEL, HOST_KEY_BYTES,
};
pub use command::{format_info, format_request, parse_command, Command, Verb, INFO_MARKER};
