/// Errors returned by client and subscription operations.
///
/// These never mutate client state themselves; they report the outcome of a
/// single user-issued command or wait.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CentrifugeError {
    #[error("client is disconnected")]
    ClientDisconnected,

    #[error("operation timed out")]
    OperationTimeout,

    #[error("a subscription already exists for this channel")]
    DuplicateSubscription,

    #[error("reply error {code}: {message}")]
    ReplyError {
        code: i32,
        message: String,
        temporary: bool,
    },

    #[error("subscription is unsubscribed")]
    SubscriptionUnsubscribed,

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Other(String),
}

impl CentrifugeError {
    pub fn from_reply(error: &centrifuge_protocol::ErrorPayload) -> Self {
        Self::ReplyError {
            code: error.code,
            message: error.message.clone(),
            temporary: error.temporary,
        }
    }
}

/// Why a token fetch failed.
///
/// `Unauthorized` is terminal for the scope (client or subscription) that
/// requested the token; any other variant is treated as temporary and
/// triggers the same reconnect/resubscribe path as a transport failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("token provider reported unauthorized")]
    Unauthorized,

    #[error("token provider failed: {0}")]
    Failed(String),
}

/// Error codes attached to `on_error` events, identifying which internal
/// path produced them. These are not part of the wire protocol; they tag
/// the circumstance under which a `tracing` event and handler callback
/// were emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    TransportClosed,
    Timeout,
    ConnectReplyError,
    SubscribeReplyError,
    ClientConnectToken,
    ClientRefreshToken,
    SubscriptionSubscribeToken,
    SubscriptionRefreshToken,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::Timeout => "TIMEOUT",
            Self::ConnectReplyError => "CONNECT_REPLY_ERROR",
            Self::SubscribeReplyError => "SUBSCRIBE_REPLY_ERROR",
            Self::ClientConnectToken => "CLIENT_CONNECT_TOKEN",
            Self::ClientRefreshToken => "CLIENT_REFRESH_TOKEN",
            Self::SubscriptionSubscribeToken => "SUBSCRIPTION_SUBSCRIBE_TOKEN",
            Self::SubscriptionRefreshToken => "SUBSCRIPTION_REFRESH_TOKEN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
