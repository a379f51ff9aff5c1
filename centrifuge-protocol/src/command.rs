use crate::{Channel, CommandId, StreamPosition};
use serde::Serialize;

/// A single outgoing command.
///
/// `id` is `0` for the client's pong (the only command with no id and no
/// params — an empty `{}` frame).
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    #[serde(skip_serializing_if = "is_zero")]
    pub id: CommandId,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub params: Option<CommandParams>,
}

fn is_zero(id: &CommandId) -> bool {
    *id == 0
}

impl Command {
    pub fn new(id: CommandId, params: CommandParams) -> Self {
        Self {
            id,
            params: Some(params),
        }
    }

    /// The empty pong command the client sends in reply to a server ping
    /// when configured to do so.
    pub fn pong() -> Self {
        Self {
            id: 0,
            params: None,
        }
    }
}

/// The parameters of an outgoing command. Exactly one variant is ever
/// present on the wire, serialized as `{"<name>": {...}}` alongside the
/// sibling `id` field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandParams {
    Connect(ConnectRequest),
    Refresh(RefreshRequest),
    Subscribe(SubscribeRequest),
    SubRefresh(SubRefreshRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    History(HistoryRequest),
    Presence(PresenceRequest),
    PresenceStats(PresenceStatsRequest),
    Rpc(RpcRequest),
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The source SDK's `sub_refresh` command carries only the new token; the
/// server correlates it with the channel via the subscription the refreshed
/// reply targets.
#[derive(Debug, Clone, Serialize)]
pub struct SubRefreshRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeRequest {
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub channel: Channel,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryRequest {
    pub channel: Channel,
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub limit: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub reverse: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<StreamPosition>,
}

fn is_zero_usize(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceRequest {
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceStatsRequest {
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub method: String,
    pub data: serde_json::Value,
}
