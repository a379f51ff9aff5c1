//! End-to-end scenario tests driving a [`crate::Client`] through its public
//! API, with the transport replaced by an in-process mock so server
//! behavior can be scripted without a socket. These exercise the scenarios
//! enumerated for this engine: happy connect/publish, auto-resubscribe,
//! token-expiry-on-connect, terminal server disconnect, no-ping timeout,
//! and publish ordering around a subscribe reply.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use centrifuge_protocol::ReplyResult;

use super::*;
use crate::config::{Protocol, TokenEvent, TokenProvider};
use crate::error::TokenError;
use crate::handlers::{
    ClientEventHandler, ConnectedContext, ConnectingContext, DisconnectedContext, ErrorContext,
    JoinContext, LeaveContext, PublicationContext, SubscribedContext, SubscribingContext,
    SubscriptionEventHandler, UnsubscribedContext,
};
use crate::subscription::SubscriptionOptions;
use crate::transport::{Connector, Transport, TransportError, TransportMessage};

struct MockTransport {
    inbound_rx: mpsc::UnboundedReceiver<Result<TransportMessage, TransportError>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: Vec<u8>) -> Result<(), TransportError> {
        let _ = self.outbound_tx.send(message);
        Ok(())
    }

    async fn receive(&mut self) -> Result<TransportMessage, TransportError> {
        match self.inbound_rx.recv().await {
            Some(result) => result,
            None => Ok(TransportMessage::Closed {
                code: 1006,
                reason: String::new(),
            }),
        }
    }

    async fn close(&mut self, _code: u16, _reason: String) -> Result<(), TransportError> {
        Ok(())
    }
}

/// One end of a connection the mock connector handed the engine; the test
/// drives the other end.
struct MockHandle {
    inbound_tx: mpsc::UnboundedSender<Result<TransportMessage, TransportError>>,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockHandle {
    fn push(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self
            .inbound_tx
            .send(Ok(TransportMessage::Data(bytes.into())));
    }

    fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.inbound_tx.send(Ok(TransportMessage::Closed {
            code,
            reason: reason.into(),
        }));
    }

    async fn next_sent(&mut self) -> serde_json::Value {
        let bytes = self.outbound_rx.recv().await.expect("engine sent nothing");
        serde_json::from_slice(&bytes).expect("engine sent non-JSON frame")
    }

    async fn next_sent_id(&mut self) -> u64 {
        self.next_sent()
            .await
            .get("id")
            .and_then(serde_json::Value::as_u64)
            .expect("frame carried no id")
    }

    /// Replies to the next outgoing command with the given bare reply
    /// object, e.g. `{"connect":{"client":"abc"}}`, stamping in its id.
    async fn reply_to_next(&mut self, bare_reply: &str) {
        let id = self.next_sent_id().await;
        let mut value: serde_json::Value = serde_json::from_str(bare_reply).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("id".into(), serde_json::Value::from(id));
        self.push(serde_json::to_vec(&value).unwrap());
    }
}

struct MockConnector {
    handles_tx: mpsc::UnboundedSender<MockHandle>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _address: &str,
        _protocol: Protocol,
        _read_limit: usize,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.handles_tx.send(MockHandle {
            inbound_tx,
            outbound_rx,
        });
        Ok(Box::new(MockTransport {
            inbound_rx,
            outbound_tx,
        }))
    }
}

fn harness() -> (MockConnector, mpsc::UnboundedReceiver<MockHandle>) {
    let (handles_tx, handles_rx) = mpsc::unbounded_channel();
    (MockConnector { handles_tx }, handles_rx)
}

fn fast_config() -> Config {
    Config {
        address: "ws://mock.invalid/connection/websocket".into(),
        timeout: Duration::from_secs(5),
        max_server_ping_delay: Duration::from_secs(2),
        ..Config::default()
    }
}

#[derive(Clone, Default)]
struct RecordingHandler {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ClientEventHandler for RecordingHandler {
    fn on_connecting(&mut self, ctx: ConnectingContext) {
        self.push(format!("connecting:{}", ctx.reason));
    }
    fn on_connected(&mut self, ctx: ConnectedContext) {
        self.push(format!("connected:{}", ctx.client_id));
    }
    fn on_disconnected(&mut self, ctx: DisconnectedContext) {
        self.push(format!("disconnected:{}:{}", ctx.code, ctx.reconnect));
    }
    fn on_error(&mut self, ctx: ErrorContext) {
        self.push(format!("error:{}", ctx.code));
    }
}

impl SubscriptionEventHandler for RecordingHandler {
    fn on_subscribing(&mut self, ctx: SubscribingContext) {
        self.push(format!("subscribing:{}", ctx.reason));
    }
    fn on_subscribed(&mut self, _ctx: SubscribedContext) {
        self.push("subscribed");
    }
    fn on_unsubscribed(&mut self, ctx: UnsubscribedContext) {
        self.push(format!("unsubscribed:{}", ctx.code));
    }
    fn on_publication(&mut self, ctx: PublicationContext) {
        self.push(format!("pub:{}", ctx.offset));
    }
    fn on_join(&mut self, _ctx: JoinContext) {}
    fn on_leave(&mut self, _ctx: LeaveContext) {}
    fn on_error(&mut self, ctx: ErrorContext) {
        self.push(format!("sub_error:{}", ctx.code));
    }
}

struct ScriptedTokenProvider {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TokenProvider for ScriptedTokenProvider {
    async fn get_token(&self, _event: TokenEvent) -> Result<String, TokenError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("token-{n}"))
    }
}

async fn connect_and_await_ready(client: &Client, conn: &mut MockHandle) {
    client.connect();
    conn.reply_to_next(r#"{"connect":{"client":"abc","ping":25,"pong":true}}"#)
        .await;
    client.ready().await.expect("client should become ready");
}

#[tokio::test(start_paused = true)]
async fn s1_happy_connect_and_publish() {
    let (connector, mut handles_rx) = harness();
    let handler = RecordingHandler::default();
    let client = Client::new_with_connector(
        fast_config(),
        None,
        Box::new(handler.clone()),
        Box::new(connector),
    );

    client.connect();
    let mut conn = handles_rx.recv().await.unwrap();
    conn.reply_to_next(r#"{"connect":{"client":"abc","ping":25,"pong":true}}"#)
        .await;
    client.ready().await.unwrap();
    assert_eq!(client.state().await.unwrap(), ClientState::Connected);

    let (result, ()) = tokio::join!(client.publish("room", serde_json::json!({"m": 1})), async {
        conn.reply_to_next(r#"{"publish":{}}"#).await;
    });
    assert!(matches!(result, Ok(ReplyResult::Publish(_))));
    assert!(handler.events().contains(&"connected:abc".to_string()));
}

#[tokio::test(start_paused = true)]
async fn s2_auto_resubscribe_after_recoverable_unsubscribe_push() {
    let (connector, mut handles_rx) = harness();
    let handler = RecordingHandler::default();
    let client = Client::new_with_connector(
        fast_config(),
        None,
        Box::new(handler.clone()),
        Box::new(connector),
    );

    let mut conn = handles_rx.recv().await.unwrap();
    connect_and_await_ready(&client, &mut conn).await;

    let sub = client
        .new_subscription("room", SubscriptionOptions::default(), handler.clone())
        .await
        .unwrap();
    sub.subscribe();
    conn.reply_to_next(r#"{"subscribe":{}}"#).await;
    sub.ready().await.unwrap();
    assert_eq!(sub.channel(), "room");

    // Server unsubscribes with a resubscribable code (>= 2500).
    conn.push(
        br#"{"push":{"channel":"room","unsubscribe":{"code":2600,"reason":"x"}}}"#.to_vec(),
    );

    // Engine should re-issue a subscribe after backoff without user intervention.
    conn.reply_to_next(r#"{"subscribe":{}}"#).await;
    sub.ready().await.unwrap();

    let events = handler.events();
    assert!(events.iter().any(|e| e == "subscribing:SERVER_UNSUBSCRIBE"));
    assert_eq!(events.iter().filter(|e| *e == "subscribed").count(), 2);
}

#[tokio::test(start_paused = true)]
async fn s3_token_expiry_on_connect_forces_refetch() {
    let (connector, mut handles_rx) = harness();
    let handler = RecordingHandler::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let provider = ScriptedTokenProvider {
        calls: calls.clone(),
    };
    let client = Client::new_with_connector(
        fast_config(),
        Some(Box::new(provider)),
        Box::new(handler.clone()),
        Box::new(connector),
    );

    client.connect();
    let mut conn = handles_rx.recv().await.unwrap();
    let sent = conn.next_sent().await;
    let id = sent.get("id").and_then(serde_json::Value::as_u64).unwrap();
    let first_token = sent
        .get("connect")
        .and_then(|c| c.get("token"))
        .and_then(serde_json::Value::as_str)
        .unwrap()
        .to_string();
    assert_eq!(first_token, "token-0");

    conn.push(
        format!(r#"{{"id":{id},"error":{{"code":109,"message":"expired","temporary":false}}}}"#)
            .into_bytes(),
    );

    // Temporary (forced by the token-expiry code) closes the transport and
    // schedules reconnect; the next attempt re-fetches the token.
    let mut conn2 = handles_rx.recv().await.unwrap();
    let second_token = conn2
        .next_sent()
        .await
        .get("connect")
        .and_then(|c| c.get("token"))
        .and_then(serde_json::Value::as_str)
        .unwrap()
        .to_string();
    assert_eq!(second_token, "token-1");
    assert!(calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn s4_terminal_server_disconnect_fails_pending_commands() {
    let (connector, mut handles_rx) = harness();
    let handler = RecordingHandler::default();
    let client = Client::new_with_connector(
        fast_config(),
        None,
        Box::new(handler.clone()),
        Box::new(connector),
    );

    let mut conn = handles_rx.recv().await.unwrap();
    connect_and_await_ready(&client, &mut conn).await;

    let (publish_result, ()) = tokio::join!(client.publish("room", serde_json::json!({})), async {
        let _ = conn.next_sent().await;
        conn.push(br#"{"push":{"disconnect":{"code":3001,"reason":"bad"}}}"#.to_vec());
    });

    assert!(matches!(
        publish_result,
        Err(CentrifugeError::ClientDisconnected)
    ));
    assert_eq!(client.state().await.unwrap(), ClientState::Disconnected);
    assert!(handler
        .events()
        .iter()
        .any(|e| e == "disconnected:3001:false"));
}

#[tokio::test(start_paused = true)]
async fn s5_no_ping_timeout_triggers_reconnect() {
    let (connector, mut handles_rx) = harness();
    let handler = RecordingHandler::default();
    let mut config = fast_config();
    config.max_server_ping_delay = Duration::from_secs(1);
    let client = Client::new_with_connector(
        config,
        None,
        Box::new(handler.clone()),
        Box::new(connector),
    );

    let mut conn = handles_rx.recv().await.unwrap();
    client.connect();
    // ping=1s, max_server_ping_delay=1s -> 2s deadline; no pings ever arrive.
    conn.reply_to_next(r#"{"connect":{"client":"abc","ping":1,"pong":false}}"#)
        .await;
    client.ready().await.unwrap();

    // A second connection attempt proves the no-ping deadline fired and
    // reconnect was scheduled.
    let _conn2 = handles_rx.recv().await.unwrap();
    assert!(handler.events().iter().any(|e| e == "disconnected:0:true"));
}

#[tokio::test(start_paused = true)]
async fn s6_publish_ordering_around_subscribe_reply() {
    let (connector, mut handles_rx) = harness();
    let handler = RecordingHandler::default();
    let client = Client::new_with_connector(
        fast_config(),
        None,
        Box::new(handler.clone()),
        Box::new(connector),
    );

    let mut conn = handles_rx.recv().await.unwrap();
    connect_and_await_ready(&client, &mut conn).await;

    let sub = client
        .new_subscription("room", SubscriptionOptions::default(), handler.clone())
        .await
        .unwrap();
    sub.subscribe();
    conn.reply_to_next(
        r#"{"subscribe":{"publications":[{"offset":1,"data":{}},{"offset":2,"data":{}}]}}"#,
    )
    .await;
    sub.ready().await.unwrap();

    conn.push(br#"{"push":{"channel":"room","pub":{"offset":3,"data":{}}}}"#.to_vec());
    // Drain the event loop: publication pushes are dispatched inline as soon
    // as the frame is decoded, so give the engine task scheduling turns
    // until it has processed the push.
    for _ in 0..50 {
        if handler.events().iter().any(|e| e == "pub:3") {
            break;
        }
        tokio::task::yield_now().await;
    }

    let events = handler.events();
    let subscribed_at = events.iter().position(|e| e == "subscribed").unwrap();
    let pub1_at = events.iter().position(|e| e == "pub:1").unwrap();
    let pub2_at = events.iter().position(|e| e == "pub:2").unwrap();
    let pub3_at = events.iter().position(|e| e == "pub:3").unwrap();
    assert!(subscribed_at < pub1_at);
    assert!(pub1_at < pub2_at);
    assert!(pub2_at < pub3_at);
}
