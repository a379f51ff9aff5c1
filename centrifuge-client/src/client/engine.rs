//! The single-task event loop that owns all client and subscription state.
//!
//! Everything that can mutate connection or subscription state funnels
//! through one `tokio::select!` loop on one spawned task: control messages
//! from [`crate::Client`]/[`crate::Subscription`] handles, timer firings, and
//! transport frames. No field here is ever touched from a second task, which
//! is what makes the ordering guarantees in the module docs free rather than
//! something a scheduler has to enforce.
//!
//! Connect and subscribe replies are *not* routed through the command
//! registry's oneshot-per-caller mechanism the way ordinary operations are:
//! nothing outside this task is waiting on them, so their post-processing
//! (`on_connect_reply`/`on_subscribe_reply`) runs inline as part of the same
//! frame-dispatch loop that would otherwise deliver a push. That inline call
//! is the barrier the spec calls for — a push later in the same frame is
//! simply the next loop iteration, which cannot start until this one
//! returns.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use centrifuge_protocol::{
    Channel, Command, CommandId, CommandParams, ConnectRequest, ErrorPayload, HistoryRequest,
    PresenceRequest, PresenceStatsRequest, PublishRequest, Push, PushData, RefreshRequest, Reply,
    ReplyResult, RpcRequest, StreamPosition, SubRefreshRequest, SubscribeRequest,
    UnsubscribeRequest, TOKEN_EXPIRED_CODE,
};
use centrifuge_protocol::{disconnect_code_is_reconnectable, unsubscribe_code_is_resubscribable};

use crate::backoff;
use crate::client::state::{ClientState, ReadySignal};
use crate::client::HistoryOptions;
use crate::codec::{Codec, JsonCodec};
use crate::config::{Config, TokenEvent, TokenProvider};
use crate::error::{CentrifugeError, ErrorCode, TokenError};
use crate::handlers::{
    ClientEventHandler, ClientInfo, ConnectedContext, ConnectingContext, DisconnectedContext,
    ErrorContext, JoinContext, LeaveContext, PublicationContext, SubscribedContext,
    SubscribingContext, SubscriptionEventHandler, UnsubscribedContext,
};
use crate::registry::{CommandOutcome, Registry};
use crate::subscription::state::{SubReadySignal, SubscriptionState};
use crate::subscription::{Subscription, SubscriptionOptions};
use crate::transport::{Connector, Transport, TransportError, TransportMessage, WebsocketConnector};

/// Messages sent by [`crate::Client`]/[`crate::Subscription`] handles into
/// the engine task. This is the only way anything outside this module
/// touches client or subscription state.
pub(crate) enum Control {
    Connect,
    Disconnect,
    State(oneshot::Sender<ClientState>),
    Publish {
        channel: Channel,
        data: serde_json::Value,
        reply: oneshot::Sender<CommandOutcome>,
    },
    History {
        channel: Channel,
        opts: HistoryOptions,
        reply: oneshot::Sender<CommandOutcome>,
    },
    Presence {
        channel: Channel,
        reply: oneshot::Sender<CommandOutcome>,
    },
    PresenceStats {
        channel: Channel,
        reply: oneshot::Sender<CommandOutcome>,
    },
    Rpc {
        method: String,
        data: serde_json::Value,
        reply: oneshot::Sender<CommandOutcome>,
    },
    NewSubscription {
        channel: Channel,
        options: SubscriptionOptions,
        handler: Box<dyn SubscriptionEventHandler>,
        reply: oneshot::Sender<Result<Subscription, CentrifugeError>>,
    },
    SubSubscribe {
        channel: Channel,
    },
    SubUnsubscribe {
        channel: Channel,
    },
    RemoveSubscription {
        channel: Channel,
        reply: oneshot::Sender<Result<(), CentrifugeError>>,
    },
}

/// Everything that reaches the loop other than control messages and
/// transport frames: every timer category the spec calls out, each
/// delivered by a spawned `tokio::time::sleep` task in the same
/// spawn-then-abort-on-cancel style as [`crate::registry::Registry`].
enum EngineEvent {
    ConnectTimeout(CommandId),
    SubscribeTimeout(Channel, CommandId),
    PingTimeout,
    ClientRefreshTimer,
    ReconnectTimer,
    ResubscribeTimer(Channel),
    SubRefreshTimer(Channel),
}

struct SubscriptionEntry {
    state: SubscriptionState,
    token: Option<String>,
    token_provider: Option<Box<dyn crate::config::SubscriptionTokenProvider>>,
    resubscribe_attempts: u32,
    resubscribe_timer: Option<JoinHandle<()>>,
    refresh_timer: Option<JoinHandle<()>>,
    pending_subscribe_id: Option<CommandId>,
    subscribe_timeout_timer: Option<JoinHandle<()>>,
    pending_sub_refresh_id: Option<CommandId>,
    ready_tx: watch::Sender<SubReadySignal>,
    handler: Box<dyn SubscriptionEventHandler>,
}

enum TokenFetchError {
    Unauthorized,
    Temporary(String),
}

pub(crate) struct Engine {
    config: Config,
    token_provider: Option<Box<dyn TokenProvider>>,
    handler: Box<dyn ClientEventHandler>,
    connector: Box<dyn Connector>,

    control_rx: mpsc::UnboundedReceiver<Control>,
    control_tx: mpsc::UnboundedSender<Control>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    command_timeout_rx: mpsc::UnboundedReceiver<CommandId>,
    ready_tx: watch::Sender<ReadySignal>,

    codec: Box<dyn Codec>,
    state: ClientState,
    transport: Option<Box<dyn Transport>>,
    next_command_id: CommandId,
    registry: Registry,
    client_id: String,

    need_reconnect: bool,
    reconnect_attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,

    send_pong: bool,
    ping_interval: Duration,
    ping_timer: Option<JoinHandle<()>>,
    refresh_timer: Option<JoinHandle<()>>,

    pending_connect_id: Option<CommandId>,
    connect_timeout_timer: Option<JoinHandle<()>>,
    pending_refresh_id: Option<CommandId>,

    subscriptions: HashMap<Channel, SubscriptionEntry>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Config,
        token_provider: Option<Box<dyn TokenProvider>>,
        handler: Box<dyn ClientEventHandler>,
        control_tx: mpsc::UnboundedSender<Control>,
        control_rx: mpsc::UnboundedReceiver<Control>,
        ready_tx: watch::Sender<ReadySignal>,
    ) -> Self {
        Self::new_with_connector(
            config,
            token_provider,
            handler,
            Box::new(WebsocketConnector),
            control_tx,
            control_rx,
            ready_tx,
        )
    }

    /// Same as [`Engine::new`], with the transport connector overridable.
    /// Exists so tests can script server behavior without a real socket.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_with_connector(
        config: Config,
        token_provider: Option<Box<dyn TokenProvider>>,
        handler: Box<dyn ClientEventHandler>,
        connector: Box<dyn Connector>,
        control_tx: mpsc::UnboundedSender<Control>,
        control_rx: mpsc::UnboundedReceiver<Control>,
        ready_tx: watch::Sender<ReadySignal>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (command_timeout_tx, command_timeout_rx) = mpsc::unbounded_channel();
        let registry = Registry::new(command_timeout_tx.clone());

        Self {
            config,
            token_provider,
            handler,
            connector,
            control_rx,
            control_tx,
            events_tx,
            events_rx,
            command_timeout_rx,
            ready_tx,
            codec: Box::new(JsonCodec),
            state: ClientState::Disconnected,
            transport: None,
            next_command_id: 0,
            registry,
            client_id: String::new(),
            need_reconnect: true,
            reconnect_attempts: 0,
            reconnect_timer: None,
            send_pong: false,
            ping_interval: Duration::ZERO,
            ping_timer: None,
            refresh_timer: None,
            pending_connect_id: None,
            connect_timeout_timer: None,
            pending_refresh_id: None,
            subscriptions: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                control = self.control_rx.recv() => {
                    match control {
                        Some(control) => self.handle_control(control).await,
                        None => break,
                    }
                }
                id = self.command_timeout_rx.recv() => {
                    if let Some(id) = id {
                        self.registry.resolve_error(id, CentrifugeError::OperationTimeout);
                    }
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                message = recv_transport(&mut self.transport), if self.transport.is_some() => {
                    self.handle_transport_message(message).await;
                }
            }
        }

        tracing::debug!("client control channel closed, shutting down engine task");
        self.internal_disconnect(0, "CLIENT_DROPPED".into(), false).await;
    }

    fn next_id(&mut self) -> CommandId {
        self.next_command_id += 1;
        self.next_command_id
    }

    // ---- control dispatch -------------------------------------------------

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Connect => self.do_connect().await,
            Control::Disconnect => {
                if self.state == ClientState::Disconnected {
                    return;
                }
                self.internal_disconnect(0, "DISCONNECT_CALLED".into(), false)
                    .await;
            }
            Control::State(reply) => {
                let _ = reply.send(self.state);
            }
            Control::Publish { channel, data, reply } => {
                self.issue_command(CommandParams::Publish(PublishRequest { channel, data }), reply)
                    .await;
            }
            Control::History { channel, opts, reply } => {
                self.issue_command(
                    CommandParams::History(HistoryRequest {
                        channel,
                        limit: opts.limit,
                        reverse: opts.reverse,
                        since: opts.since,
                    }),
                    reply,
                )
                .await;
            }
            Control::Presence { channel, reply } => {
                self.issue_command(CommandParams::Presence(PresenceRequest { channel }), reply)
                    .await;
            }
            Control::PresenceStats { channel, reply } => {
                self.issue_command(
                    CommandParams::PresenceStats(PresenceStatsRequest { channel }),
                    reply,
                )
                .await;
            }
            Control::Rpc { method, data, reply } => {
                self.issue_command(CommandParams::Rpc(RpcRequest { method, data }), reply)
                    .await;
            }
            Control::NewSubscription {
                channel,
                options,
                handler,
                reply,
            } => self.do_new_subscription(channel, options, handler, reply),
            Control::SubSubscribe { channel } => self.do_subscribe(&channel).await,
            Control::SubUnsubscribe { channel } => {
                self.do_unsubscribe_called(&channel).await;
            }
            Control::RemoveSubscription { channel, reply } => {
                self.do_remove_subscription(&channel, reply);
            }
        }
    }

    async fn issue_command(&mut self, params: CommandParams, reply: oneshot::Sender<CommandOutcome>) {
        if self.state != ClientState::Connected {
            let _ = reply.send(Err(CentrifugeError::ClientDisconnected));
            return;
        }
        let id = self.next_id();
        self.registry.register_with(id, self.config.timeout, reply);
        let command = Command::new(id, params);
        if !self.send_one(&command).await {
            self.registry
                .resolve_error(id, CentrifugeError::ClientDisconnected);
            self.on_transport_failure("failed to send command".into()).await;
        }
    }

    async fn send_one(&mut self, command: &Command) -> bool {
        let bytes = match self.codec.encode_commands(std::slice::from_ref(command)) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(?err, "failed to encode outgoing command");
                return false;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.send(bytes).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(?err, "transport send failed");
                false
            }
        }
    }

    // ---- client connection procedure (spec §4.2) --------------------------

    async fn do_connect(&mut self) {
        if matches!(self.state, ClientState::Connecting | ClientState::Connected) {
            return;
        }
        self.set_state(ClientState::Connecting);
        self.refresh_ready_signal_if_resolved();
        self.need_reconnect = true;
        self.handler.on_connecting(ConnectingContext {
            reason: "CONNECT_CALLED",
        });
        self.run_connection_attempt().await;
    }

    async fn run_connection_attempt(&mut self) {
        let transport = match self
            .connector
            .connect(&self.config.address, self.config.protocol, self.config.read_limit)
            .await
        {
            Ok(transport) => transport,
            Err(err) => {
                tracing::warn!(?err, "failed to open websocket connection");
                self.emit_error(ErrorCode::TransportClosed, None, err.to_string());
                self.schedule_reconnect();
                return;
            }
        };
        self.transport = Some(transport);

        let token = match self.resolve_client_token(TokenEvent::Connect).await {
            Ok(token) => token,
            Err(TokenFetchError::Unauthorized) => {
                self.internal_disconnect(0, "UNAUTHORIZED".into(), false).await;
                return;
            }
            Err(TokenFetchError::Temporary(message)) => {
                self.emit_error(ErrorCode::ClientConnectToken, None, message);
                self.close_transport_silently().await;
                self.schedule_reconnect();
                return;
            }
        };

        let id = self.next_id();
        let command = Command::new(
            id,
            CommandParams::Connect(ConnectRequest {
                token,
                name: self.config.name.clone(),
                version: self.config.version.clone(),
                data: self.config.data.clone(),
            }),
        );
        if !self.send_one(&command).await {
            self.emit_error(
                ErrorCode::TransportClosed,
                None,
                "failed to send connect command".into(),
            );
            self.close_transport_silently().await;
            self.schedule_reconnect();
            return;
        }

        self.pending_connect_id = Some(id);
        self.connect_timeout_timer = Some(self.arm_timeout(move |events_tx, timeout| {
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events_tx.send(EngineEvent::ConnectTimeout(id));
            })
        }));
    }

    /// Spawns a `sleep`-then-post task. Factored out only so every timer
    /// category arms itself the same way the registry does.
    fn arm_timeout(
        &self,
        spawn: impl FnOnce(mpsc::UnboundedSender<EngineEvent>, Duration) -> JoinHandle<()>,
    ) -> JoinHandle<()> {
        spawn(self.events_tx.clone(), self.config.timeout)
    }

    async fn resolve_client_token(&mut self, event: TokenEvent) -> Result<Option<String>, TokenFetchError> {
        if let Some(token) = &self.config.token {
            return Ok(Some(token.clone()));
        }
        let provider = self.token_provider.take();
        let result = if let Some(provider) = &provider {
            match provider.get_token(event).await {
                Ok(token) => Ok(Some(token)),
                Err(TokenError::Unauthorized) => Err(TokenFetchError::Unauthorized),
                Err(TokenError::Failed(message)) => Err(TokenFetchError::Temporary(message)),
            }
        } else {
            Ok(None)
        };
        self.token_provider = provider;
        result
    }

    async fn on_connect_reply(&mut self, id: CommandId, error: Option<ErrorPayload>, result: Option<ReplyResult>) {
        if self.pending_connect_id != Some(id) {
            return;
        }
        self.pending_connect_id = None;
        if let Some(timer) = self.connect_timeout_timer.take() {
            timer.abort();
        }

        match (error, result) {
            (Some(mut err), _) => {
                let mut temporary = err.temporary;
                if err.code == TOKEN_EXPIRED_CODE {
                    temporary = true;
                    self.config.token = None;
                }
                if temporary {
                    self.emit_error(ErrorCode::ConnectReplyError, None, std::mem::take(&mut err.message));
                    self.close_transport_silently().await;
                    self.schedule_reconnect();
                } else {
                    self.internal_disconnect(err.code as u32, err.message, false).await;
                }
            }
            (None, Some(ReplyResult::Connect(connect))) => self.on_connect_success(connect).await,
            (None, _) => {
                tracing::warn!("connect reply carried neither an error nor a connect result");
            }
        }
    }

    async fn on_connect_timeout(&mut self, id: CommandId) {
        if self.pending_connect_id != Some(id) {
            return;
        }
        self.pending_connect_id = None;
        self.emit_error(ErrorCode::Timeout, None, "connect reply timed out".into());
        self.close_transport_silently().await;
        self.schedule_reconnect();
    }

    async fn on_connect_success(&mut self, connect: centrifuge_protocol::ConnectResult) {
        self.client_id = connect.client;
        self.set_state(ClientState::Connected);
        self.send_pong = connect.pong;

        self.cancel_ping_timer();
        self.ping_interval = Duration::from_secs(connect.ping);
        if connect.ping > 0 {
            self.arm_ping_timer();
        }

        self.cancel_client_refresh_timer();
        if connect.expires && connect.ttl > 0 {
            self.arm_client_refresh_timer(Duration::from_secs(connect.ttl));
        }

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.reconnect_attempts = 0;

        self.ready_tx.send_replace(ReadySignal::Ready);
        self.handler.on_connected(ConnectedContext {
            client_id: self.client_id.clone(),
            version: connect.version,
            data: connect.data,
        });

        let subscribing: Vec<Channel> = self
            .subscriptions
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Subscribing)
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in subscribing {
            self.send_subscribe_command(&channel).await;
        }
    }

    // ---- reconnect scheduling ----------------------------------------------

    fn schedule_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if !self.need_reconnect {
            return;
        }
        self.set_state(ClientState::Connecting);
        let delay = backoff::next_delay(&self.config.reconnect_backoff, self.reconnect_attempts);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        let events_tx = self.events_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(EngineEvent::ReconnectTimer);
        }));
    }

    async fn close_transport_silently(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close(1000, String::new()).await;
        }
    }

    fn set_state(&mut self, state: ClientState) {
        self.state = state;
    }

    fn refresh_ready_signal_if_resolved(&mut self) {
        if !matches!(*self.ready_tx.borrow(), ReadySignal::Pending) {
            self.ready_tx.send_replace(ReadySignal::Pending);
        }
    }

    // ---- ping / refresh timers ----------------------------------------------

    fn cancel_ping_timer(&mut self) {
        if let Some(timer) = self.ping_timer.take() {
            timer.abort();
        }
    }

    fn arm_ping_timer(&mut self) {
        self.cancel_ping_timer();
        let deadline = self.ping_interval + self.config.max_server_ping_delay;
        let events_tx = self.events_tx.clone();
        self.ping_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = events_tx.send(EngineEvent::PingTimeout);
        }));
    }

    fn cancel_client_refresh_timer(&mut self) {
        if let Some(timer) = self.refresh_timer.take() {
            timer.abort();
        }
    }

    fn arm_client_refresh_timer(&mut self, ttl: Duration) {
        self.cancel_client_refresh_timer();
        let events_tx = self.events_tx.clone();
        self.refresh_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = events_tx.send(EngineEvent::ClientRefreshTimer);
        }));
    }

    async fn on_server_ping(&mut self) {
        if self.state != ClientState::Connected {
            return;
        }
        // Any ping restarts the no-ping deadline, measured from now.
        self.arm_ping_timer();
        if self.send_pong {
            let pong = Command::pong();
            self.send_one(&pong).await;
        }
    }

    async fn on_ping_timeout(&mut self) {
        self.internal_disconnect(0, "NO_PING".into(), true).await;
    }

    async fn on_client_refresh_timer(&mut self) {
        match self.resolve_client_token(TokenEvent::Refresh).await {
            Err(TokenFetchError::Unauthorized) => {
                self.internal_disconnect(0, "UNAUTHORIZED".into(), false).await;
            }
            Err(TokenFetchError::Temporary(message)) => {
                self.emit_error(ErrorCode::ClientRefreshToken, None, message);
            }
            Ok(None) => {
                tracing::debug!("refresh timer fired with no token to send");
            }
            Ok(Some(token)) => {
                let id = self.next_id();
                let command = Command::new(id, CommandParams::Refresh(RefreshRequest { token }));
                self.send_one(&command).await;
                self.pending_refresh_id = Some(id);
            }
        }
    }

    async fn on_refresh_reply(&mut self, id: CommandId, error: Option<ErrorPayload>, result: Option<ReplyResult>) {
        if self.pending_refresh_id != Some(id) {
            return;
        }
        self.pending_refresh_id = None;
        match (error, result) {
            (Some(err), _) => {
                self.emit_error(ErrorCode::ClientRefreshToken, None, err.message);
            }
            (None, Some(ReplyResult::Refresh(refresh))) => {
                self.cancel_client_refresh_timer();
                if refresh.expires && refresh.ttl > 0 {
                    self.arm_client_refresh_timer(Duration::from_secs(refresh.ttl));
                }
            }
            (None, _) => tracing::warn!("refresh reply carried neither an error nor a refresh result"),
        }
    }

    // ---- subscriptions (spec §4.3) -----------------------------------------

    fn do_new_subscription(
        &mut self,
        channel: Channel,
        options: SubscriptionOptions,
        handler: Box<dyn SubscriptionEventHandler>,
        reply: oneshot::Sender<Result<Subscription, CentrifugeError>>,
    ) {
        if self.subscriptions.contains_key(&channel) {
            let _ = reply.send(Err(CentrifugeError::DuplicateSubscription));
            return;
        }
        let (ready_tx, ready_rx) = watch::channel(SubReadySignal::Pending);
        self.subscriptions.insert(
            channel.clone(),
            SubscriptionEntry {
                state: SubscriptionState::Unsubscribed,
                token: options.token,
                token_provider: options.token_provider,
                resubscribe_attempts: 0,
                resubscribe_timer: None,
                refresh_timer: None,
                pending_subscribe_id: None,
                subscribe_timeout_timer: None,
                pending_sub_refresh_id: None,
                ready_tx,
                handler,
            },
        );
        let subscription = Subscription::new(channel, self.control_tx.clone(), ready_rx, self.config.timeout);
        let _ = reply.send(Ok(subscription));
    }

    fn do_remove_subscription(&mut self, channel: &str, reply: oneshot::Sender<Result<(), CentrifugeError>>) {
        match self.subscriptions.get(channel) {
            Some(entry) if entry.state == SubscriptionState::Unsubscribed => {
                self.subscriptions.remove(channel);
                let _ = reply.send(Ok(()));
            }
            Some(_) => {
                let _ = reply.send(Err(CentrifugeError::SubscriptionUnsubscribed));
            }
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn do_subscribe(&mut self, channel: &str) {
        let already_subscribing = match self.subscriptions.get(channel) {
            Some(entry) => entry.state == SubscriptionState::Subscribing,
            None => return,
        };
        if already_subscribing {
            return;
        }
        if let Some(entry) = self.subscriptions.get_mut(channel) {
            entry.state = SubscriptionState::Subscribing;
            if !matches!(*entry.ready_tx.borrow(), SubReadySignal::Pending) {
                entry.ready_tx.send_replace(SubReadySignal::Pending);
            }
            entry.handler.on_subscribing(SubscribingContext {
                reason: "SUBSCRIBE_CALLED",
            });
        }
        if self.state == ClientState::Connected {
            self.send_subscribe_command(channel).await;
        }
    }

    async fn send_subscribe_command(&mut self, channel: &str) {
        let static_token = self.subscriptions.get(channel).and_then(|e| e.token.clone());
        let provider = self
            .subscriptions
            .get_mut(channel)
            .and_then(|e| e.token_provider.take());

        let token_result: Result<Option<String>, TokenFetchError> = if let Some(token) = static_token {
            Ok(Some(token))
        } else if let Some(provider) = &provider {
            match provider.get_token(TokenEvent::Connect).await {
                Ok(token) => Ok(Some(token)),
                Err(TokenError::Unauthorized) => Err(TokenFetchError::Unauthorized),
                Err(TokenError::Failed(message)) => Err(TokenFetchError::Temporary(message)),
            }
        } else {
            Ok(None)
        };
        if let Some(provider) = provider {
            if let Some(entry) = self.subscriptions.get_mut(channel) {
                entry.token_provider = Some(provider);
            }
        }

        match token_result {
            Err(TokenFetchError::Unauthorized) => {
                self.move_subscription_unsubscribed(channel, 0, "UNAUTHORIZED".into()).await;
            }
            Err(TokenFetchError::Temporary(message)) => {
                self.emit_sub_error(channel, ErrorCode::SubscriptionSubscribeToken, message);
                self.schedule_resubscribe(channel);
            }
            Ok(token) => {
                let id = self.next_id();
                let command = Command::new(
                    id,
                    CommandParams::Subscribe(SubscribeRequest {
                        channel: channel.to_string(),
                        token,
                    }),
                );
                if !self.send_one(&command).await {
                    self.emit_sub_error(
                        channel,
                        ErrorCode::SubscribeReplyError,
                        "failed to send subscribe command".into(),
                    );
                    self.schedule_resubscribe(channel);
                    return;
                }
                let events_tx = self.events_tx.clone();
                let timeout = self.config.timeout;
                let channel_owned = channel.to_string();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = events_tx.send(EngineEvent::SubscribeTimeout(channel_owned, id));
                });
                if let Some(entry) = self.subscriptions.get_mut(channel) {
                    entry.pending_subscribe_id = Some(id);
                    entry.subscribe_timeout_timer = Some(timer);
                }
            }
        }
    }

    async fn on_subscribe_reply(
        &mut self,
        channel: Channel,
        id: CommandId,
        error: Option<ErrorPayload>,
        result: Option<ReplyResult>,
    ) {
        let still_pending = match self.subscriptions.get_mut(&channel) {
            Some(entry) if entry.pending_subscribe_id == Some(id) => {
                entry.pending_subscribe_id = None;
                if let Some(timer) = entry.subscribe_timeout_timer.take() {
                    timer.abort();
                }
                entry.state == SubscriptionState::Subscribing
            }
            _ => false,
        };
        if !still_pending {
            return;
        }

        match (error, result) {
            (Some(mut err), _) => {
                let mut temporary = err.temporary;
                if err.code == TOKEN_EXPIRED_CODE {
                    temporary = true;
                    if let Some(entry) = self.subscriptions.get_mut(&channel) {
                        entry.token = None;
                    }
                }
                if temporary {
                    self.emit_sub_error(&channel, ErrorCode::SubscribeReplyError, std::mem::take(&mut err.message));
                    self.schedule_resubscribe(&channel);
                } else {
                    self.move_subscription_unsubscribed(&channel, err.code as u32, err.message).await;
                }
            }
            (None, Some(ReplyResult::Subscribe(sub))) => self.on_subscribe_success(&channel, sub).await,
            (None, _) => tracing::warn!(%channel, "malformed subscribe reply"),
        }
    }

    async fn on_subscribe_timeout(&mut self, channel: Channel, id: CommandId) {
        let matched = match self.subscriptions.get_mut(&channel) {
            Some(entry) if entry.pending_subscribe_id == Some(id) => {
                entry.pending_subscribe_id = None;
                true
            }
            _ => false,
        };
        if !matched {
            return;
        }
        self.emit_sub_error(&channel, ErrorCode::Timeout, "subscribe reply timed out".into());
        self.schedule_resubscribe(&channel);
    }

    async fn on_subscribe_success(&mut self, channel: &str, sub: centrifuge_protocol::SubscribeResult) {
        let stream_position = if sub.positioned {
            Some(StreamPosition {
                offset: sub.offset,
                epoch: sub.epoch.clone(),
            })
        } else {
            None
        };

        if let Some(entry) = self.subscriptions.get_mut(channel) {
            entry.state = SubscriptionState::Subscribed;
            entry.ready_tx.send_replace(SubReadySignal::Ready);
        }
        if sub.expires && sub.ttl > 0 {
            self.arm_sub_refresh_timer(channel, Duration::from_secs(sub.ttl));
        }

        let publications = sub.publications.clone();
        if let Some(entry) = self.subscriptions.get_mut(channel) {
            entry.handler.on_subscribed(SubscribedContext {
                channel: channel.to_string(),
                recoverable: sub.recoverable,
                positioned: sub.positioned,
                stream_position,
                was_recovering: sub.was_recovering,
                recovered: sub.recovered,
                data: sub.data,
            });
            for publication in publications {
                entry.handler.on_publication(PublicationContext {
                    channel: channel.to_string(),
                    offset: publication.offset,
                    data: publication.data,
                    info: publication.info.map(ClientInfo::from),
                });
            }
            entry.resubscribe_attempts = 0;
            if let Some(timer) = entry.resubscribe_timer.take() {
                timer.abort();
            }
        }
    }

    async fn do_unsubscribe_called(&mut self, channel: &str) {
        self.move_subscription_unsubscribed(channel, 0, "UNSUBSCRIBE_CALLED".into()).await;
        if self.state == ClientState::Connected {
            let id = self.next_id();
            let (reply_tx, _reply_rx) = oneshot::channel();
            self.registry.register_with(id, self.config.timeout, reply_tx);
            let command = Command::new(
                id,
                CommandParams::Unsubscribe(UnsubscribeRequest {
                    channel: channel.to_string(),
                }),
            );
            self.send_one(&command).await;
        }
    }

    async fn move_subscription_unsubscribed(&mut self, channel: &str, code: u32, reason: String) {
        let Some(entry) = self.subscriptions.get_mut(channel) else {
            return;
        };
        entry.state = SubscriptionState::Unsubscribed;
        entry.pending_subscribe_id = None;
        entry.pending_sub_refresh_id = None;
        if let Some(timer) = entry.subscribe_timeout_timer.take() {
            timer.abort();
        }
        if let Some(timer) = entry.resubscribe_timer.take() {
            timer.abort();
        }
        if let Some(timer) = entry.refresh_timer.take() {
            timer.abort();
        }
        entry.resubscribe_attempts = 0;
        entry
            .ready_tx
            .send_replace(SubReadySignal::Failed(reason.clone()));
        entry.handler.on_unsubscribed(UnsubscribedContext { code, reason });
    }

    fn schedule_resubscribe(&mut self, channel: &str) {
        let Some(entry) = self.subscriptions.get_mut(channel) else {
            return;
        };
        if let Some(timer) = entry.resubscribe_timer.take() {
            timer.abort();
        }
        let delay = backoff::next_delay(&self.config.resubscribe_backoff, entry.resubscribe_attempts);
        entry.resubscribe_attempts = entry.resubscribe_attempts.saturating_add(1);
        let events_tx = self.events_tx.clone();
        let channel_owned = channel.to_string();
        entry.resubscribe_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(EngineEvent::ResubscribeTimer(channel_owned));
        }));
    }

    fn arm_sub_refresh_timer(&mut self, channel: &str, ttl: Duration) {
        let Some(entry) = self.subscriptions.get_mut(channel) else {
            return;
        };
        if let Some(timer) = entry.refresh_timer.take() {
            timer.abort();
        }
        let events_tx = self.events_tx.clone();
        let channel_owned = channel.to_string();
        entry.refresh_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = events_tx.send(EngineEvent::SubRefreshTimer(channel_owned));
        }));
    }

    async fn on_sub_refresh_timer(&mut self, channel: Channel) {
        if !self.subscriptions.contains_key(&channel) {
            return;
        }
        let static_token = self.subscriptions.get(&channel).and_then(|e| e.token.clone());
        let provider = self
            .subscriptions
            .get_mut(&channel)
            .and_then(|e| e.token_provider.take());

        let token_result: Result<Option<String>, TokenFetchError> = if let Some(token) = static_token {
            Ok(Some(token))
        } else if let Some(provider) = &provider {
            match provider.get_token(TokenEvent::Refresh).await {
                Ok(token) => Ok(Some(token)),
                Err(TokenError::Unauthorized) => Err(TokenFetchError::Unauthorized),
                Err(TokenError::Failed(message)) => Err(TokenFetchError::Temporary(message)),
            }
        } else {
            Ok(None)
        };
        if let Some(provider) = provider {
            if let Some(entry) = self.subscriptions.get_mut(&channel) {
                entry.token_provider = Some(provider);
            }
        }

        match token_result {
            Err(TokenFetchError::Unauthorized) => {
                self.move_subscription_unsubscribed(&channel, 0, "UNAUTHORIZED".into()).await;
                if self.state == ClientState::Connected {
                    let id = self.next_id();
                    let (reply_tx, _reply_rx) = oneshot::channel();
                    self.registry.register_with(id, self.config.timeout, reply_tx);
                    let command = Command::new(
                        id,
                        CommandParams::Unsubscribe(UnsubscribeRequest {
                            channel: channel.clone(),
                        }),
                    );
                    self.send_one(&command).await;
                }
            }
            Err(TokenFetchError::Temporary(message)) => {
                self.emit_sub_error(&channel, ErrorCode::SubscriptionRefreshToken, message);
                self.schedule_resubscribe(&channel);
            }
            Ok(None) => tracing::debug!(%channel, "sub-refresh timer fired with no token to send"),
            Ok(Some(token)) => {
                let id = self.next_id();
                let command = Command::new(id, CommandParams::SubRefresh(SubRefreshRequest { token }));
                self.send_one(&command).await;
                if let Some(entry) = self.subscriptions.get_mut(&channel) {
                    entry.pending_sub_refresh_id = Some(id);
                }
            }
        }
    }

    async fn on_sub_refresh_reply(
        &mut self,
        channel: Channel,
        id: CommandId,
        error: Option<ErrorPayload>,
        result: Option<ReplyResult>,
    ) {
        let still_pending = match self.subscriptions.get_mut(&channel) {
            Some(entry) if entry.pending_sub_refresh_id == Some(id) => {
                entry.pending_sub_refresh_id = None;
                true
            }
            _ => false,
        };
        if !still_pending {
            return;
        }
        match (error, result) {
            (Some(err), _) => {
                self.emit_sub_error(&channel, ErrorCode::SubscriptionRefreshToken, err.message);
            }
            (None, Some(ReplyResult::SubRefresh(refresh))) => {
                if refresh.expires && refresh.ttl > 0 {
                    self.arm_sub_refresh_timer(&channel, Duration::from_secs(refresh.ttl));
                }
            }
            (None, _) => tracing::warn!(%channel, "sub-refresh reply carried neither an error nor a result"),
        }
    }

    // ---- event / frame dispatch ---------------------------------------------

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ConnectTimeout(id) => self.on_connect_timeout(id).await,
            EngineEvent::SubscribeTimeout(channel, id) => self.on_subscribe_timeout(channel, id).await,
            EngineEvent::PingTimeout => self.on_ping_timeout().await,
            EngineEvent::ClientRefreshTimer => self.on_client_refresh_timer().await,
            EngineEvent::ReconnectTimer => self.run_connection_attempt_if_connecting().await,
            EngineEvent::ResubscribeTimer(channel) => {
                if self.state == ClientState::Connected {
                    self.send_subscribe_command(&channel).await;
                }
            }
            EngineEvent::SubRefreshTimer(channel) => self.on_sub_refresh_timer(channel).await,
        }
    }

    async fn run_connection_attempt_if_connecting(&mut self) {
        if self.state != ClientState::Connecting || !self.need_reconnect {
            return;
        }
        self.run_connection_attempt().await;
    }

    async fn handle_transport_message(&mut self, message: Result<TransportMessage, TransportError>) {
        match message {
            Ok(TransportMessage::Data(bytes)) => self.handle_frame(bytes).await,
            Ok(TransportMessage::Closed { code, reason }) => {
                self.transport = None;
                self.on_transport_closed(code, reason).await;
            }
            Err(err) => {
                self.transport = None;
                tracing::debug!(?err, "transport error while receiving");
                self.on_transport_failure(err.to_string()).await;
            }
        }
    }

    async fn handle_frame(&mut self, bytes: Vec<u8>) {
        let replies = match self.codec.decode_replies(&bytes) {
            Ok(replies) => replies,
            Err(err) => {
                tracing::warn!(?err, "failed to decode server message");
                return;
            }
        };
        for reply in replies {
            self.dispatch_reply(reply).await;
        }
    }

    async fn dispatch_reply(&mut self, reply: Reply) {
        if reply.id > 0 {
            if self.pending_connect_id == Some(reply.id) {
                self.on_connect_reply(reply.id, reply.error, reply.result).await;
                return;
            }
            if self.pending_refresh_id == Some(reply.id) {
                self.on_refresh_reply(reply.id, reply.error, reply.result).await;
                return;
            }
            let pending_subscribe_channel = self.subscriptions.iter().find_map(|(channel, entry)| {
                (entry.pending_subscribe_id == Some(reply.id)).then(|| channel.clone())
            });
            if let Some(channel) = pending_subscribe_channel {
                self.on_subscribe_reply(channel, reply.id, reply.error, reply.result).await;
                return;
            }
            let pending_sub_refresh_channel = self.subscriptions.iter().find_map(|(channel, entry)| {
                (entry.pending_sub_refresh_id == Some(reply.id)).then(|| channel.clone())
            });
            if let Some(channel) = pending_sub_refresh_channel {
                self.on_sub_refresh_reply(channel, reply.id, reply.error, reply.result).await;
                return;
            }
            match (reply.error, reply.result) {
                (Some(err), _) => self.registry.resolve_reply_error(reply.id, err),
                (None, Some(result)) => self.registry.resolve_success(reply.id, result),
                (None, None) => tracing::trace!(id = reply.id, "reply with neither error nor result"),
            }
            return;
        }

        if let Some(push) = reply.push {
            self.dispatch_push(push).await;
            return;
        }

        self.on_server_ping().await;
    }

    async fn dispatch_push(&mut self, push: Push) {
        let channel = push.channel;
        match push.data {
            PushData::Publication(publication) => {
                if let Some(entry) = self.subscriptions.get_mut(&channel) {
                    entry.handler.on_publication(PublicationContext {
                        channel: channel.clone(),
                        offset: publication.offset,
                        data: publication.data,
                        info: publication.info.map(ClientInfo::from),
                    });
                }
            }
            PushData::Join(info) => {
                if let Some(entry) = self.subscriptions.get_mut(&channel) {
                    entry.handler.on_join(JoinContext {
                        channel: channel.clone(),
                        info: ClientInfo::from(info),
                    });
                }
            }
            PushData::Leave(info) => {
                if let Some(entry) = self.subscriptions.get_mut(&channel) {
                    entry.handler.on_leave(LeaveContext {
                        channel: channel.clone(),
                        info: ClientInfo::from(info),
                    });
                }
            }
            PushData::Unsubscribe(payload) => {
                if unsubscribe_code_is_resubscribable(payload.code) {
                    if let Some(entry) = self.subscriptions.get_mut(&channel) {
                        entry.state = SubscriptionState::Subscribing;
                        if !matches!(*entry.ready_tx.borrow(), SubReadySignal::Pending) {
                            entry.ready_tx.send_replace(SubReadySignal::Pending);
                        }
                        entry.handler.on_subscribing(SubscribingContext {
                            reason: "SERVER_UNSUBSCRIBE",
                        });
                    }
                    self.schedule_resubscribe(&channel);
                } else {
                    self.move_subscription_unsubscribed(&channel, payload.code, payload.reason).await;
                }
            }
            PushData::Disconnect(payload) => {
                let reconnect = disconnect_code_is_reconnectable(payload.code);
                self.internal_disconnect(payload.code, payload.reason, reconnect).await;
            }
            PushData::Unknown(kind) => {
                tracing::trace!(%channel, kind, "ignoring unknown push kind");
            }
        }
    }

    async fn on_transport_closed(&mut self, code: u16, reason: String) {
        // Below 3000: standard websocket close codes, including 1009
        // ("message too large"), always reconnect. At or above 3000: the
        // server's own close code, subject to the same reconnect-range rule
        // as a push `disconnect`.
        let reconnect = if code < 3000 {
            true
        } else {
            disconnect_code_is_reconnectable(u32::from(code))
        };
        self.emit_error(ErrorCode::TransportClosed, None, reason.clone());
        self.internal_disconnect(u32::from(code), reason, reconnect).await;
    }

    async fn on_transport_failure(&mut self, message: String) {
        self.emit_error(ErrorCode::TransportClosed, None, message.clone());
        self.internal_disconnect(0, message, true).await;
    }

    // ---- internal disconnect (spec §4.2) -----------------------------------

    async fn internal_disconnect(&mut self, code: u32, reason: String, reconnect: bool) {
        self.cancel_ping_timer();
        self.cancel_client_refresh_timer();

        if !reconnect {
            self.need_reconnect = false;
        }

        if self.state == ClientState::Disconnected {
            return;
        }

        self.registry.cancel_all(CentrifugeError::ClientDisconnected);
        self.pending_connect_id = None;
        self.pending_refresh_id = None;
        if let Some(timer) = self.connect_timeout_timer.take() {
            timer.abort();
        }

        self.refresh_ready_signal_if_resolved();
        if !reconnect {
            self.ready_tx
                .send_replace(ReadySignal::Failed("client disconnected".into()));
        }

        self.set_state(if reconnect {
            ClientState::Connecting
        } else {
            ClientState::Disconnected
        });

        self.close_transport_silently().await;

        let subscribed_channels: Vec<Channel> = self
            .subscriptions
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Subscribed)
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in subscribed_channels {
            if let Some(entry) = self.subscriptions.get_mut(&channel) {
                entry.state = SubscriptionState::Subscribing;
                if !matches!(*entry.ready_tx.borrow(), SubReadySignal::Pending) {
                    entry.ready_tx.send_replace(SubReadySignal::Pending);
                }
                entry.handler.on_subscribing(SubscribingContext {
                    reason: "TRANSPORT_CLOSED",
                });
            }
        }

        self.handler.on_disconnected(DisconnectedContext {
            code,
            reason,
            reconnect,
        });

        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn emit_error(&mut self, code: ErrorCode, channel: Option<Channel>, message: String) {
        tracing::warn!(code = %code, channel = ?channel, %message, "client error");
        self.handler.on_error(ErrorContext { code, channel, message });
    }

    fn emit_sub_error(&mut self, channel: &str, code: ErrorCode, message: String) {
        tracing::debug!(code = %code, %channel, %message, "subscription error");
        let ctx = ErrorContext {
            code,
            channel: Some(channel.to_string()),
            message,
        };
        if let Some(entry) = self.subscriptions.get_mut(channel) {
            entry.handler.on_error(ctx);
        }
    }
}

async fn recv_transport(
    transport: &mut Option<Box<dyn Transport>>,
) -> Result<TransportMessage, TransportError> {
    match transport.as_mut() {
        Some(transport) => transport.receive().await,
        None => std::future::pending().await,
    }
}
