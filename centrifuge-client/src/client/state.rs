/// The client's top-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// The value carried by the replaceable "connected" signal.
///
/// `ready()` subscribes to this and resolves as soon as it leaves `Pending`.
/// A fresh `Pending` is published every time the client leaves `Connected`,
/// per the one-shot-signal-replacement invariant.
#[derive(Debug, Clone)]
pub enum ReadySignal {
    Pending,
    Ready,
    Failed(String),
}
