use crate::{Channel, CommandId, ErrorPayload};
use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde::{Deserialize as DeriveDeserialize, Serialize};
use std::collections::HashMap;

/// A single decoded server reply.
///
/// Exactly one of the following holds, mirroring the wire protocol:
/// - `id > 0` and `error` is set: a failed command reply.
/// - `id > 0` and `result` is set: a successful command reply.
/// - `id == 0` and `push` is set: a server-initiated push.
/// - `id == 0`, `push` and `result` both absent: a server ping.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub id: CommandId,
    pub error: Option<ErrorPayload>,
    pub push: Option<Push>,
    pub result: Option<ReplyResult>,
}

impl Reply {
    pub fn is_ping(&self) -> bool {
        self.id == 0 && self.push.is_none() && self.result.is_none() && self.error.is_none()
    }
}

/// Command-reply payloads, keyed by which field the server populated.
#[derive(Debug, Clone)]
pub enum ReplyResult {
    Connect(ConnectResult),
    Refresh(RefreshResult),
    Subscribe(SubscribeResult),
    SubRefresh(SubRefreshResult),
    Publish(PublishResult),
    History(HistoryResult),
    Presence(PresenceResult),
    PresenceStats(PresenceStatsResult),
    Rpc(RpcResult),
    Unsubscribe(UnsubscribeResult),
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct ConnectResult {
    pub client: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub ping: u64,
    #[serde(default)]
    pub pong: bool,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct RefreshResult {
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct SubscribeResult {
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default)]
    pub positioned: bool,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub epoch: String,
    #[serde(default)]
    pub was_recovering: bool,
    #[serde(default)]
    pub recovered: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub publications: Vec<WirePublication>,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct SubRefreshResult {
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct PublishResult {}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct HistoryResult {
    #[serde(default)]
    pub publications: Vec<WirePublication>,
    #[serde(default)]
    pub epoch: String,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct PresenceResult {
    #[serde(default)]
    pub presence: HashMap<String, WireClientInfo>,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct PresenceStatsResult {
    #[serde(default)]
    pub num_clients: u32,
    #[serde(default)]
    pub num_users: u32,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct RpcResult {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct UnsubscribeResult {}

#[derive(Debug, Clone, Default, DeriveDeserialize, Serialize)]
pub struct WirePublication {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub info: Option<WireClientInfo>,
}

#[derive(Debug, Clone, Default, DeriveDeserialize, Serialize)]
pub struct WireClientInfo {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub conn_info: Option<serde_json::Value>,
    #[serde(default)]
    pub chan_info: Option<serde_json::Value>,
}

/// A server-initiated push, not correlated to any client command.
#[derive(Debug, Clone)]
pub struct Push {
    pub channel: Channel,
    pub data: PushData,
}

#[derive(Debug, Clone)]
pub enum PushData {
    Publication(WirePublication),
    Join(WireClientInfo),
    Leave(WireClientInfo),
    Unsubscribe(UnsubscribePush),
    Disconnect(DisconnectPush),
    /// A push payload keyed by something other than the five known kinds.
    /// Carries the unrecognized key so the caller can log it; the push
    /// itself is otherwise ignored rather than failing the whole frame.
    Unknown(String),
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct UnsubscribePush {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, DeriveDeserialize)]
pub struct DisconnectPush {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub reason: String,
}

/// The known result-payload keys, tried in order against a decoded frame
/// object. The wire protocol guarantees at most one is present.
const RESULT_KEYS: &[&str] = &[
    "connect",
    "refresh",
    "subscribe",
    "sub_refresh",
    "publish",
    "history",
    "presence",
    "presence_stats",
    "rpc",
    "unsubscribe",
];

const PUSH_KEYS: &[&str] = &["pub", "join", "leave", "unsubscribe", "disconnect"];

impl<'de> Deserialize<'de> for Reply {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = serde_json::Map::deserialize(deserializer)?;

        let id = map
            .get("id")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as CommandId;

        let error = match map.get("error") {
            Some(value) => {
                Some(serde_json::from_value(value.clone()).map_err(DeError::custom)?)
            }
            None => None,
        };

        let push = match map.get("push") {
            Some(value) => Some(deserialize_push(value).map_err(DeError::custom)?),
            None => None,
        };

        let mut result = None;
        for key in RESULT_KEYS {
            if let Some(value) = map.get(*key) {
                result = Some(deserialize_result(key, value.clone()).map_err(DeError::custom)?);
                break;
            }
        }

        Ok(Reply {
            id,
            error,
            push,
            result,
        })
    }
}

fn deserialize_result(key: &str, value: serde_json::Value) -> Result<ReplyResult, serde_json::Error> {
    Ok(match key {
        "connect" => ReplyResult::Connect(serde_json::from_value(value)?),
        "refresh" => ReplyResult::Refresh(serde_json::from_value(value)?),
        "subscribe" => ReplyResult::Subscribe(serde_json::from_value(value)?),
        "sub_refresh" => ReplyResult::SubRefresh(serde_json::from_value(value)?),
        "publish" => ReplyResult::Publish(serde_json::from_value(value)?),
        "history" => ReplyResult::History(serde_json::from_value(value)?),
        "presence" => ReplyResult::Presence(serde_json::from_value(value)?),
        "presence_stats" => ReplyResult::PresenceStats(serde_json::from_value(value)?),
        "rpc" => ReplyResult::Rpc(serde_json::from_value(value)?),
        "unsubscribe" => ReplyResult::Unsubscribe(serde_json::from_value(value)?),
        _ => unreachable!("key restricted to RESULT_KEYS"),
    })
}

/// Decodes a single `push` payload. An unrecognized payload kind is not a
/// decode failure: it becomes [`PushData::Unknown`] so the caller can log
/// and skip it without losing the rest of the frame's replies.
fn deserialize_push(value: &serde_json::Value) -> Result<Push, serde_json::Error> {
    let channel = value
        .get("channel")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_owned();

    for key in PUSH_KEYS {
        if let Some(inner) = value.get(*key) {
            let data = match *key {
                "pub" => PushData::Publication(serde_json::from_value(inner.clone())?),
                "join" => PushData::Join(serde_json::from_value(inner.clone())?),
                "leave" => PushData::Leave(serde_json::from_value(inner.clone())?),
                "unsubscribe" => PushData::Unsubscribe(serde_json::from_value(inner.clone())?),
                "disconnect" => PushData::Disconnect(serde_json::from_value(inner.clone())?),
                _ => unreachable!("key restricted to PUSH_KEYS"),
            };
            return Ok(Push { channel, data });
        }
    }

    let unknown_key = value
        .as_object()
        .and_then(|map| map.keys().find(|key| key.as_str() != "channel"))
        .cloned()
        .unwrap_or_else(|| "<empty>".to_string());
    Ok(Push {
        channel,
        data: PushData::Unknown(unknown_key),
    })
}
