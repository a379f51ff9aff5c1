use std::collections::HashMap;
use std::time::Duration;

use centrifuge_protocol::{CommandId, ErrorPayload, ReplyResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::CentrifugeError;

/// What a pending command resolves to.
pub type CommandOutcome = Result<ReplyResult, CentrifugeError>;

struct PendingReply {
    reply_tx: oneshot::Sender<CommandOutcome>,
    timeout_task: Option<JoinHandle<()>>,
}

/// Correlates outgoing command ids with the reply each is waiting on, and
/// enforces a per-command timeout.
///
/// Ordering between a command's reply and any push that follows it in the
/// same decoded batch is not this type's concern: the engine task dispatches
/// a decoded batch strictly in order, running each item's full handling
/// (including `on_connected`/`on_subscribed` post-processing) to completion
/// before moving to the next, which is what actually produces the ordering
/// guarantee. See `DESIGN.md` for why this replaces a separate barrier
/// primitive.
pub struct Registry {
    pending: HashMap<CommandId, PendingReply>,
    timeout_tx: mpsc::UnboundedSender<CommandId>,
}

impl Registry {
    /// `timeout_tx` is the engine's own event channel: a fired timer posts
    /// the expired command id back onto it so the timeout is applied on the
    /// engine task, never from the timer task directly.
    pub fn new(timeout_tx: mpsc::UnboundedSender<CommandId>) -> Self {
        Self {
            pending: HashMap::new(),
            timeout_tx,
        }
    }

    pub fn register(&mut self, id: CommandId, timeout: Duration) -> oneshot::Receiver<CommandOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.register_with(id, timeout, reply_tx);
        reply_rx
    }

    /// Same as [`Registry::register`], but the caller supplies the channel's
    /// sender — used when the eventual receiver already lives on another
    /// task (e.g. the public API call that is waiting for this command).
    pub fn register_with(&mut self, id: CommandId, timeout: Duration, reply_tx: oneshot::Sender<CommandOutcome>) {
        let timeout_task = if timeout > Duration::ZERO {
            let timeout_tx = self.timeout_tx.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timeout_tx.send(id);
            }))
        } else {
            None
        };

        self.pending.insert(
            id,
            PendingReply {
                reply_tx,
                timeout_task,
            },
        );
    }

    fn take(&mut self, id: CommandId) -> Option<PendingReply> {
        let entry = self.pending.remove(&id)?;
        if let Some(task) = &entry.timeout_task {
            task.abort();
        }
        Some(entry)
    }

    pub fn is_pending(&self, id: CommandId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Resolves a pending command with its reply payload. A no-op if the
    /// command already resolved (timeout raced the reply) or is unknown.
    pub fn resolve_success(&mut self, id: CommandId, result: ReplyResult) {
        if let Some(entry) = self.take(id) {
            let _ = entry.reply_tx.send(Ok(result));
        }
    }

    pub fn resolve_reply_error(&mut self, id: CommandId, error: ErrorPayload) {
        if let Some(entry) = self.take(id) {
            let _ = entry.reply_tx.send(Err(CentrifugeError::from_reply(&error)));
        }
    }

    pub fn resolve_error(&mut self, id: CommandId, error: CentrifugeError) {
        if let Some(entry) = self.take(id) {
            let _ = entry.reply_tx.send(Err(error));
        }
    }

    /// Fails every outstanding command, e.g. on disconnect.
    pub fn cancel_all(&mut self, error: CentrifugeError) {
        for (_, entry) in self.pending.drain() {
            if let Some(task) = &entry.timeout_task {
                task.abort();
            }
            let _ = entry.reply_tx.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = Registry::new(tx);
        let reply_rx = registry.register(1, Duration::from_secs(5));

        registry.resolve_success(1, ReplyResult::Publish(centrifuge_protocol::PublishResult {}));
        // Second resolution is a no-op: the record is already gone.
        registry.resolve_error(1, CentrifugeError::ClientDisconnected);

        assert!(matches!(reply_rx.await, Ok(Ok(ReplyResult::Publish(_)))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn timeout_fires_into_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = Registry::new(tx);
        let reply_rx = registry.register(7, Duration::from_millis(10));

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired, 7);
        registry.resolve_error(expired, CentrifugeError::OperationTimeout);

        assert!(matches!(reply_rx.await, Ok(Err(CentrifugeError::OperationTimeout))));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_pending_command() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = Registry::new(tx);
        let a = registry.register(1, Duration::from_secs(5));
        let b = registry.register(2, Duration::from_secs(5));

        registry.cancel_all(CentrifugeError::ClientDisconnected);

        assert!(matches!(a.await, Ok(Err(CentrifugeError::ClientDisconnected))));
        assert!(matches!(b.await, Ok(Err(CentrifugeError::ClientDisconnected))));
        assert!(registry.is_empty());
    }
}
