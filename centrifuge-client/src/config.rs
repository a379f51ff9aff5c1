use std::time::Duration;

use async_trait::async_trait;

use crate::error::TokenError;

/// Which codec/subprotocol the client negotiates with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Json,
    Protobuf,
}

impl Protocol {
    /// The websocket subprotocol token to advertise, if any.
    pub fn subprotocol(self) -> Option<&'static str> {
        match self {
            Self::Json => None,
            Self::Protobuf => Some("centrifuge-protobuf"),
        }
    }
}

/// Exponential-with-jitter backoff bounds, shared by reconnect and
/// resubscribe scheduling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            factor: 2.0,
            jitter: 0.5,
        }
    }
}

/// The reason a fresh connection token is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEvent {
    Connect,
    Refresh,
}

/// Supplies connection-level tokens, invoked on initial connect and on
/// scheduled refresh.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self, event: TokenEvent) -> Result<String, TokenError>;
}

/// Supplies per-subscription tokens, invoked on initial subscribe and on
/// scheduled sub-refresh.
#[async_trait]
pub trait SubscriptionTokenProvider: Send + Sync + 'static {
    async fn get_token(&self, event: TokenEvent) -> Result<String, TokenError>;
}

/// Immutable, cloneable connection configuration.
///
/// Built through [`ClientBuilder`]; mirrors the role the teacher crate gives
/// its own connection-options type, but carries Centrifuge-specific knobs
/// (backoff bounds, ping tolerance, protocol flavor) instead of websocket
/// auth/query parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub protocol: Protocol,
    pub name: String,
    pub version: String,
    pub data: Option<serde_json::Value>,
    pub token: Option<String>,
    pub timeout: Duration,
    pub max_server_ping_delay: Duration,
    pub reconnect_backoff: BackoffConfig,
    pub resubscribe_backoff: BackoffConfig,
    pub read_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: String::new(),
            protocol: Protocol::Json,
            name: "rust".into(),
            version: String::new(),
            data: None,
            token: None,
            timeout: Duration::from_secs(5),
            max_server_ping_delay: Duration::from_secs(10),
            reconnect_backoff: BackoffConfig::default(),
            resubscribe_backoff: BackoffConfig::default(),
            read_limit: 64 * 1024 * 1024,
        }
    }
}

/// Builds a [`Config`] and, finally, a [`crate::Client`].
///
/// Mirrors the teacher crate's `ConnectionOptions::with_*` chain.
pub struct ClientBuilder {
    config: Config,
    token_provider: Option<Box<dyn TokenProvider>>,
}

impl ClientBuilder {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            config: Config {
                address: address.into(),
                ..Config::default()
            },
            token_provider: None,
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn token_provider(mut self, provider: impl TokenProvider) -> Self {
        self.token_provider = Some(Box::new(provider));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.config.data = Some(data);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_server_ping_delay(mut self, delay: Duration) -> Self {
        self.config.max_server_ping_delay = delay;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.reconnect_backoff = backoff;
        self
    }

    pub fn resubscribe_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.resubscribe_backoff = backoff;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn read_limit(mut self, limit: usize) -> Self {
        self.config.read_limit = limit;
        self
    }

    pub fn build(self, handler: impl crate::handlers::ClientEventHandler) -> crate::Client {
        crate::Client::new(self.config, self.token_provider, Box::new(handler))
    }
}
