use serde::{Deserialize, Serialize};

/// The `error` payload carried by a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub temporary: bool,
}

/// Numeric code indicating the server requested the client re-fetch its
/// connection token because the previously supplied one expired.
pub const TOKEN_EXPIRED_CODE: i32 = 109;

/// Whether a server-initiated disconnect code (either a push `disconnect`
/// payload or the websocket close code, remapped into the same numeric
/// space) should be followed by a reconnect attempt.
///
/// Per the wire protocol: codes in `[3500, 4000)` and `[4500, 5000)` are
/// reconnectable; every other code at or above 3000 is terminal.
pub fn disconnect_code_is_reconnectable(code: u32) -> bool {
    (3500..4000).contains(&code) || (4500..5000).contains(&code)
}

/// Whether a server-initiated `unsubscribe` push code should trigger a
/// resubscribe attempt rather than a terminal unsubscribe.
///
/// Codes below 2500 are terminal; codes at or above 2500 are resubscribable.
pub fn unsubscribe_code_is_resubscribable(code: u32) -> bool {
    code >= 2500
}

/// The websocket close code meaning "message too large", remapped to the
/// client-disconnect code space.
pub const WS_MESSAGE_TOO_LARGE: u16 = 1009;
