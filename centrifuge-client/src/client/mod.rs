//! The public, cloneable handle to a running client.
//!
//! Mirrors the teacher crate's `Client`: a thin wrapper around an unbounded
//! control channel into a single task that owns all real state. Every method
//! here either posts a fire-and-forget [`engine::Control`] or posts one and
//! awaits a oneshot reply; none of them touch connection state directly.

mod engine;
#[cfg(test)]
mod scenario_tests;
pub mod state;

use tokio::sync::{mpsc, oneshot, watch};

use centrifuge_protocol::{Channel, StreamPosition};

use crate::config::{ClientBuilder, Config, TokenProvider};
use crate::error::CentrifugeError;
use crate::handlers::ClientEventHandler;
use crate::registry::CommandOutcome;
use crate::subscription::{Subscription, SubscriptionOptions};

pub(crate) use engine::Control;
pub use state::{ClientState, ReadySignal};

/// Parameters for a `history` call, mirroring the wire request's optional
/// fields with client-friendly defaults (no limit, forward order, no
/// position cursor).
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub limit: u32,
    pub reverse: bool,
    pub since: Option<StreamPosition>,
}

/// A handle to a Centrifuge connection.
///
/// Cloning a `Client` is cheap and shares the same underlying connection;
/// every clone talks to the same engine task.
#[derive(Clone)]
pub struct Client {
    control_tx: mpsc::UnboundedSender<Control>,
    ready_rx: watch::Receiver<ReadySignal>,
}

impl Client {
    /// Starts building a client for the given websocket address.
    pub fn builder(address: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(address)
    }

    pub(crate) fn new(
        config: Config,
        token_provider: Option<Box<dyn TokenProvider>>,
        handler: Box<dyn ClientEventHandler>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(ReadySignal::Pending);

        let engine = engine::Engine::new(
            config,
            token_provider,
            handler,
            control_tx.clone(),
            control_rx,
            ready_tx,
        );
        tokio::spawn(engine.run());

        Self { control_tx, ready_rx }
    }

    /// Test-only entry point: builds a client whose engine opens connections
    /// through the given [`crate::transport::Connector`] instead of a real
    /// websocket, so scenario tests can script server behavior in-process.
    #[cfg(test)]
    pub(crate) fn new_with_connector(
        config: Config,
        token_provider: Option<Box<dyn TokenProvider>>,
        handler: Box<dyn ClientEventHandler>,
        connector: Box<dyn crate::transport::Connector>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(ReadySignal::Pending);

        let engine = engine::Engine::new_with_connector(
            config,
            token_provider,
            handler,
            connector,
            control_tx.clone(),
            control_rx,
            ready_tx,
        );
        tokio::spawn(engine.run());

        Self { control_tx, ready_rx }
    }

    /// Starts (or resumes) connecting. Idempotent: a no-op while already
    /// connecting or connected.
    pub fn connect(&self) {
        let _ = self.control_tx.send(Control::Connect);
    }

    /// Tears down the connection and suppresses any further automatic
    /// reconnect attempt until [`Client::connect`] is called again.
    pub fn disconnect(&self) {
        let _ = self.control_tx.send(Control::Disconnect);
    }

    /// The client's current top-level state.
    pub async fn state(&self) -> Result<ClientState, CentrifugeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::State(reply_tx))
            .map_err(|_| CentrifugeError::ClientDisconnected)?;
        reply_rx.await.map_err(|_| CentrifugeError::ClientDisconnected)
    }

    /// Resolves once the client reaches `Connected`, or fails if it instead
    /// settles into a terminal disconnect first. A fresh call after the
    /// client leaves `Connected` again waits on the next connection attempt.
    pub async fn ready(&self) -> Result<(), CentrifugeError> {
        let mut rx = self.ready_rx.clone();
        loop {
            match &*rx.borrow() {
                ReadySignal::Ready => return Ok(()),
                ReadySignal::Failed(reason) => {
                    return Err(CentrifugeError::Other(reason.clone()));
                }
                ReadySignal::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(CentrifugeError::ClientDisconnected);
            }
        }
    }

    /// Publishes data on a channel without a subscription. Waits for
    /// [`Client::ready`] before sending.
    pub async fn publish(&self, channel: impl Into<Channel>, data: serde_json::Value) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::Publish {
            channel: channel.into(),
            data,
            reply,
        })
        .await
    }

    /// Fetches channel publication history. Waits for [`Client::ready`].
    pub async fn history(&self, channel: impl Into<Channel>, opts: HistoryOptions) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::History {
            channel: channel.into(),
            opts,
            reply,
        })
        .await
    }

    /// Fetches the current set of clients present on a channel. Waits for
    /// [`Client::ready`].
    pub async fn presence(&self, channel: impl Into<Channel>) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::Presence {
            channel: channel.into(),
            reply,
        })
        .await
    }

    /// Fetches presence counts (cheaper than [`Client::presence`] when only
    /// the counts are needed). Waits for [`Client::ready`].
    pub async fn presence_stats(&self, channel: impl Into<Channel>) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::PresenceStats {
            channel: channel.into(),
            reply,
        })
        .await
    }

    /// Issues a server-side RPC call unrelated to any channel. Waits for
    /// [`Client::ready`].
    pub async fn rpc(&self, method: impl Into<String>, data: serde_json::Value) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::Rpc {
            method: method.into(),
            data,
            reply,
        })
        .await
    }

    /// Creates a new per-channel [`Subscription`], starting in the
    /// `Unsubscribed` state. Fails if a subscription already exists for this
    /// channel on this client.
    pub async fn new_subscription(
        &self,
        channel: impl Into<Channel>,
        options: SubscriptionOptions,
        handler: impl crate::handlers::SubscriptionEventHandler,
    ) -> Result<Subscription, CentrifugeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::NewSubscription {
                channel: channel.into(),
                options,
                handler: Box::new(handler),
                reply: reply_tx,
            })
            .map_err(|_| CentrifugeError::ClientDisconnected)?;
        reply_rx.await.map_err(|_| CentrifugeError::ClientDisconnected)?
    }

    /// Sends a command and awaits its reply.
    ///
    /// No timeout is applied here: every command registered with the engine
    /// is already timed out by [`crate::registry::Registry`] using the same
    /// `Config::timeout`, which resolves this oneshot with
    /// [`CentrifugeError::OperationTimeout`] on expiry.
    async fn call(&self, build: impl FnOnce(oneshot::Sender<CommandOutcome>) -> Control) -> CommandOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(build(reply_tx))
            .map_err(|_| CentrifugeError::ClientDisconnected)?;
        reply_rx.await.map_err(|_| CentrifugeError::ClientDisconnected)?
    }
}
