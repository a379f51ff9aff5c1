use centrifuge_protocol::{Channel, StreamPosition};

use crate::error::ErrorCode;

/// Handlers for client-level (connection) lifecycle events.
///
/// All methods default to no-ops, mirroring the teacher crate's
/// `ConnectionHandler` shape. Handlers run inline on the client's single
/// event-loop task, so their relative ordering is exactly the order these
/// methods are invoked — the dispatcher never re-serializes them.
pub trait ClientEventHandler: Send + 'static {
    fn on_connecting(&mut self, _ctx: ConnectingContext) {}
    fn on_connected(&mut self, _ctx: ConnectedContext) {}
    fn on_disconnected(&mut self, _ctx: DisconnectedContext) {}
    fn on_error(&mut self, _ctx: ErrorContext) {}
}

/// Handlers for a single subscription's lifecycle events.
pub trait SubscriptionEventHandler: Send + 'static {
    fn on_subscribing(&mut self, _ctx: SubscribingContext) {}
    fn on_subscribed(&mut self, _ctx: SubscribedContext) {}
    fn on_unsubscribed(&mut self, _ctx: UnsubscribedContext) {}
    fn on_publication(&mut self, _ctx: PublicationContext) {}
    fn on_join(&mut self, _ctx: JoinContext) {}
    fn on_leave(&mut self, _ctx: LeaveContext) {}
    fn on_error(&mut self, _ctx: ErrorContext) {}
}

#[derive(Debug, Clone)]
pub struct ConnectingContext {
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct ConnectedContext {
    pub client_id: String,
    pub version: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct DisconnectedContext {
    pub code: u32,
    pub reason: String,
    pub reconnect: bool,
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub code: ErrorCode,
    pub channel: Option<Channel>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SubscribingContext {
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct SubscribedContext {
    pub channel: Channel,
    pub recoverable: bool,
    pub positioned: bool,
    pub stream_position: Option<StreamPosition>,
    pub was_recovering: bool,
    pub recovered: bool,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribedContext {
    pub code: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PublicationContext {
    pub channel: Channel,
    pub offset: u64,
    pub data: Option<serde_json::Value>,
    pub info: Option<ClientInfo>,
}

#[derive(Debug, Clone)]
pub struct JoinContext {
    pub channel: Channel,
    pub info: ClientInfo,
}

#[derive(Debug, Clone)]
pub struct LeaveContext {
    pub channel: Channel,
    pub info: ClientInfo,
}

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub client: String,
    pub user: String,
    pub conn_info: Option<serde_json::Value>,
    pub chan_info: Option<serde_json::Value>,
}

impl From<centrifuge_protocol::WireClientInfo> for ClientInfo {
    fn from(info: centrifuge_protocol::WireClientInfo) -> Self {
        Self {
            client: info.client,
            user: info.user,
            conn_info: info.conn_info,
            chan_info: info.chan_info,
        }
    }
}
