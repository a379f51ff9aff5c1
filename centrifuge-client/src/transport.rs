use async_trait::async_trait;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;

use crate::config::Protocol;

pub type TungsteniteError = tokio_tungstenite::tungstenite::Error;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid websocket address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        source: url::ParseError,
    },

    #[error("address {0:?} is not a ws:// or wss:// url")]
    UnsupportedScheme(String),

    #[error("failed to open websocket connection: {0}")]
    ConnectFailed(TungsteniteError),

    #[error("websocket transport error: {0}")]
    Io(TungsteniteError),

    #[error("failed to close websocket connection: {0}")]
    ClosingFailed(TungsteniteError),
}

/// A decoded inbound transport event.
#[derive(Debug)]
pub enum TransportMessage {
    /// A complete text or binary frame, handed to the codec as-is.
    Data(Vec<u8>),
    /// The connection ended, with the close code/reason if the peer sent
    /// one (absent for an ungraceful close, e.g. a dropped TCP socket).
    Closed { code: u16, reason: String },
}

/// Opens, reads from, writes to, and closes a single duplex connection.
///
/// Message framing is opaque bytes; the [`crate::codec::Codec`] decides
/// textual vs binary encoding. Implementations must surface connection-closed
/// distinctly from a parse/IO error so the client event loop can apply the
/// close-code reconnect policy instead of treating it as a generic failure.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError>;

    /// Awaits the next frame or close event. Once this returns
    /// `Ok(TransportMessage::Closed { .. })` or `Err`, the transport is
    /// exhausted and must not be polled again.
    async fn receive(&mut self) -> Result<TransportMessage, TransportError>;

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError>;
}

/// Opens a [`Transport`] for a given address/protocol.
///
/// Factored out of [`crate::client::engine::Engine`] purely so tests can
/// substitute a scripted transport without reaching the network; the
/// production path always uses [`WebsocketConnector`].
#[async_trait]
pub(crate) trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        address: &str,
        protocol: Protocol,
        read_limit: usize,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// The connector shipped with this crate: opens a real websocket via
/// [`WebsocketTransport::connect_with_read_limit`].
pub(crate) struct WebsocketConnector;

#[async_trait]
impl Connector for WebsocketConnector {
    async fn connect(
        &self,
        address: &str,
        protocol: Protocol,
        read_limit: usize,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let transport = WebsocketTransport::connect_with_read_limit(address, protocol, read_limit).await?;
        Ok(Box::new(transport))
    }
}

/// The websocket implementation shipped with this crate, built on
/// `tokio-tungstenite`.
pub struct WebsocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    binary: bool,
}

impl WebsocketTransport {
    /// Opens a websocket connection, advertising the protocol-appropriate
    /// subprotocol (binary codecs negotiate `centrifuge-protobuf`; the JSON
    /// codec uses the default, subprotocol-free handshake) and capping
    /// inbound frame/message size at `Config::read_limit`.
    pub async fn connect(address: &str, protocol: Protocol) -> Result<Self, TransportError> {
        Self::connect_with_read_limit(address, protocol, 64 * 1024 * 1024).await
    }

    /// Same as [`WebsocketTransport::connect`], with the inbound read limit
    /// (in bytes) overridable. [`crate::client::engine::Engine`] calls this
    /// with `Config::read_limit` rather than the hardcoded default.
    pub async fn connect_with_read_limit(
        address: &str,
        protocol: Protocol,
        read_limit: usize,
    ) -> Result<Self, TransportError> {
        let parsed = url::Url::parse(address).map_err(|source| TransportError::InvalidAddress {
            address: address.to_string(),
            source,
        })?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::UnsupportedScheme(address.to_string()));
        }

        let mut request = address
            .into_client_request()
            .map_err(TransportError::ConnectFailed)?;

        if let Some(subprotocol) = protocol.subprotocol() {
            if let Ok(value) = subprotocol.parse() {
                request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }
        }

        let config = WebSocketConfig {
            max_message_size: Some(read_limit),
            max_frame_size: Some(read_limit),
            ..Default::default()
        };

        let (socket, _response) = connect_async_with_config(request, Some(config), false)
            .await
            .map_err(TransportError::ConnectFailed)?;

        Ok(Self {
            socket,
            binary: protocol != Protocol::Json,
        })
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError> {
        let frame = if self.binary {
            Message::Binary(message)
        } else {
            Message::Text(String::from_utf8_lossy(&message).into_owned())
        };
        self.socket.send(frame).await.map_err(TransportError::Io)
    }

    async fn receive(&mut self) -> Result<TransportMessage, TransportError> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Ok(TransportMessage::Data(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(TransportMessage::Data(data)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                        None => (1005, String::new()),
                    };
                    return Ok(TransportMessage::Closed { code, reason });
                }
                // Ping/Pong/Frame variants are handled transparently by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(TransportError::Io(err)),
                None => {
                    return Ok(TransportMessage::Closed {
                        code: 1006,
                        reason: String::new(),
                    })
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        self.socket
            .close(Some(frame))
            .await
            .map_err(TransportError::ClosingFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let err = WebsocketTransport::connect("https://example.com", Protocol::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn rejects_unparseable_address() {
        let err = WebsocketTransport::connect("not a url", Protocol::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }
}
