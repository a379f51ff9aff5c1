//! The public handle to a single channel subscription.
//!
//! Like [`crate::Client`], a `Subscription` is a thin handle: it posts
//! [`crate::client::Control`] messages into the owning client's single
//! engine task and otherwise holds no state of its own beyond a channel name
//! and a `watch` receiver for its "subscribed" readiness signal.

pub mod state;

use tokio::sync::{mpsc, oneshot, watch};

use centrifuge_protocol::Channel;

use crate::client::{Control, HistoryOptions};
use crate::config::SubscriptionTokenProvider;
use crate::error::CentrifugeError;
use crate::registry::CommandOutcome;
use state::SubReadySignal;

/// Per-subscription options supplied to [`crate::Client::new_subscription`].
#[derive(Default)]
pub struct SubscriptionOptions {
    pub token: Option<String>,
    pub token_provider: Option<Box<dyn SubscriptionTokenProvider>>,
}

/// A handle to a single channel subscription.
#[derive(Clone)]
pub struct Subscription {
    channel: Channel,
    control_tx: mpsc::UnboundedSender<Control>,
    ready_rx: watch::Receiver<SubReadySignal>,
}

impl Subscription {
    pub(crate) fn new(
        channel: Channel,
        control_tx: mpsc::UnboundedSender<Control>,
        ready_rx: watch::Receiver<SubReadySignal>,
        _timeout: std::time::Duration,
    ) -> Self {
        Self {
            channel,
            control_tx,
            ready_rx,
        }
    }

    /// The channel this subscription was created for.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Starts (or resumes) subscribing. Idempotent while already
    /// `Subscribing` or `Subscribed`.
    pub fn subscribe(&self) {
        let _ = self.control_tx.send(Control::SubSubscribe {
            channel: self.channel.clone(),
        });
    }

    /// Tears down the subscription and suppresses automatic resubscription
    /// until [`Subscription::subscribe`] is called again.
    pub fn unsubscribe(&self) {
        let _ = self.control_tx.send(Control::SubUnsubscribe {
            channel: self.channel.clone(),
        });
    }

    /// Removes this subscription from the owning client entirely. Fails if
    /// the subscription is not currently `Unsubscribed`.
    pub async fn remove(&self) -> Result<(), CentrifugeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Control::RemoveSubscription {
                channel: self.channel.clone(),
                reply: reply_tx,
            })
            .map_err(|_| CentrifugeError::ClientDisconnected)?;
        reply_rx.await.map_err(|_| CentrifugeError::ClientDisconnected)?
    }

    /// Resolves once the subscription reaches `Subscribed`, or fails if it
    /// instead settles into `Unsubscribed` first.
    pub async fn ready(&self) -> Result<(), CentrifugeError> {
        let mut rx = self.ready_rx.clone();
        loop {
            match &*rx.borrow() {
                SubReadySignal::Ready => return Ok(()),
                SubReadySignal::Failed(reason) => {
                    return Err(CentrifugeError::Other(reason.clone()));
                }
                SubReadySignal::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(CentrifugeError::ClientDisconnected);
            }
        }
    }

    /// Publishes data on this channel. Waits for the subscription to reach
    /// `Subscribed` before sending, per the owning client's channel-
    /// parameterized `publish`.
    pub async fn publish(&self, data: serde_json::Value) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::Publish {
            channel: self.channel.clone(),
            data,
            reply,
        })
        .await
    }

    /// Fetches this channel's publication history. Waits for `Subscribed`.
    pub async fn history(&self, opts: HistoryOptions) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::History {
            channel: self.channel.clone(),
            opts,
            reply,
        })
        .await
    }

    /// Fetches the current set of clients present on this channel. Waits for
    /// `Subscribed`.
    pub async fn presence(&self) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::Presence {
            channel: self.channel.clone(),
            reply,
        })
        .await
    }

    /// Fetches presence counts for this channel. Waits for `Subscribed`.
    pub async fn presence_stats(&self) -> CommandOutcome {
        self.ready().await?;
        self.call(|reply| Control::PresenceStats {
            channel: self.channel.clone(),
            reply,
        })
        .await
    }

    async fn call(&self, build: impl FnOnce(oneshot::Sender<CommandOutcome>) -> Control) -> CommandOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(build(reply_tx))
            .map_err(|_| CentrifugeError::ClientDisconnected)?;
        reply_rx.await.map_err(|_| CentrifugeError::ClientDisconnected)?
    }
}
