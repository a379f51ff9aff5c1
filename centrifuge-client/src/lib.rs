//! A connection and subscription lifecycle client for the Centrifuge
//! real-time messaging protocol.
//!
//! [`Client`] drives a single websocket connection through
//! `Disconnected -> Connecting -> Connected`, with automatic reconnect and
//! token refresh. Each [`Subscription`] obtained from it drives its own
//! `Unsubscribed -> Subscribing -> Subscribed` state independently,
//! resubscribing after transport drops and refreshing its own token on the
//! server's schedule. Both machines, and everything they touch, live on one
//! task per client, driven by a single `tokio::select!` loop.

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
mod registry;
pub mod subscription;
pub mod transport;

pub use client::{Client, ClientState, HistoryOptions, ReadySignal};
pub use registry::CommandOutcome;
pub use config::{
    BackoffConfig, ClientBuilder, Config, Protocol, SubscriptionTokenProvider, TokenEvent,
    TokenProvider,
};
pub use error::{CentrifugeError, ErrorCode, TokenError};
pub use handlers::{
    ClientEventHandler, ClientInfo, ConnectedContext, ConnectingContext, DisconnectedContext,
    ErrorContext, JoinContext, LeaveContext, PublicationContext, SubscribedContext,
    SubscribingContext, SubscriptionEventHandler, UnsubscribedContext,
};
pub use subscription::state::{SubReadySignal, SubscriptionState};
pub use subscription::{Subscription, SubscriptionOptions};
