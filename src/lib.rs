//! Umbrella crate re-exporting the Centrifuge wire protocol and, by default,
//! the connection/subscription client built on top of it.

pub use centrifuge_protocol as protocol;

#[cfg(feature = "client")]
pub use centrifuge_client::*;
