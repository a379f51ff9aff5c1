/// A single subscription's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// The value carried by a subscription's replaceable "subscribed" signal.
///
/// Mirrors [`crate::client::state::ReadySignal`] one level down: a fresh
/// `Pending` is published every time the subscription leaves `Subscribed`.
#[derive(Debug, Clone)]
pub enum SubReadySignal {
    Pending,
    Ready,
    Failed(String),
}
