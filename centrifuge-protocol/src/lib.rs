//! Wire types for the Centrifuge real-time protocol.
//!
//! This crate has no behavior of its own: it only describes the shape of
//! commands sent to the server and replies/pushes received from it. The
//! connection and subscription lifecycle that drives these types lives in
//! `centrifuge-client`.

mod command;
mod error;
mod reply;

pub use command::*;
pub use error::*;
pub use reply::*;

/// A command/reply correlation identifier.
///
/// Strictly positive and monotonically increasing for the lifetime of a
/// client instance; `0` is reserved to mean "no id" (pings and pongs).
pub type CommandId = u32;

/// A channel name. Centrifuge channels are opaque strings from the core's
/// point of view; any additional structure (namespaces, private-channel
/// markers) is a server-side convention.
pub type Channel = String;

/// A point in a channel's publication history, used to resume a subscription
/// without replaying messages already seen.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct StreamPosition {
    pub offset: u64,
    #[serde(default)]
    pub epoch: String,
}
