use centrifuge_protocol::{Command, Reply};

/// Encodes outgoing command batches and decodes incoming reply batches.
///
/// The codec owns the bit-layout of a transport frame; the rest of the
/// engine only ever sees [`Command`]/[`Reply`] values.
pub trait Codec: Send + Sync + 'static {
    fn encode_commands(&self, commands: &[Command]) -> Result<Vec<u8>, CodecError>;
    fn decode_replies(&self, message: &[u8]) -> Result<Vec<Reply>, CodecError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode commands: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode reply: {0}")]
    Decode(serde_json::Error),
}

/// The JSON codec shipped with this crate.
///
/// A batch of exactly one command is encoded as that command's bare object,
/// not a singleton array — the convention real Centrifugo-family servers
/// expect. A decoded frame may likewise be a single object or an array of
/// reply objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_commands(&self, commands: &[Command]) -> Result<Vec<u8>, CodecError> {
        let bytes = match commands {
            [single] => serde_json::to_vec(single),
            many => serde_json::to_vec(many),
        }
        .map_err(CodecError::Encode)?;
        Ok(bytes)
    }

    fn decode_replies(&self, message: &[u8]) -> Result<Vec<Reply>, CodecError> {
        let value: serde_json::Value =
            serde_json::from_slice(message).map_err(CodecError::Decode)?;

        match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(CodecError::Decode))
                .collect(),
            other => {
                let reply = serde_json::from_value(other).map_err(CodecError::Decode)?;
                Ok(vec![reply])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use centrifuge_protocol::{CommandParams, PresenceRequest};

    #[test]
    fn single_command_encodes_as_bare_object() {
        let codec = JsonCodec;
        let command = Command::new(1, CommandParams::Presence(PresenceRequest {
            channel: "chat".into(),
        }));
        let bytes = codec.encode_commands(std::slice::from_ref(&command)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.is_object());
        assert_eq!(value.get("id").and_then(serde_json::Value::as_u64), Some(1));
    }

    #[test]
    fn multi_command_encodes_as_array() {
        let codec = JsonCodec;
        let commands = vec![
            Command::new(1, CommandParams::Presence(PresenceRequest {
                channel: "a".into(),
            })),
            Command::new(2, CommandParams::Presence(PresenceRequest {
                channel: "b".into(),
            })),
        ];
        let bytes = codec.encode_commands(&commands).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn decodes_single_object_and_array() {
        let codec = JsonCodec;
        let single = codec.decode_replies(br#"{"id":1}"#).unwrap();
        assert_eq!(single.len(), 1);

        let many = codec.decode_replies(br#"[{"id":1},{"id":2}]"#).unwrap();
        assert_eq!(many.len(), 2);
    }

    #[test]
    fn decodes_empty_ping_frame() {
        let codec = JsonCodec;
        let replies = codec.decode_replies(b"{}").unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ping());
    }
}
