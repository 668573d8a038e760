//! Framed message channel over an established peer connection.
//!
//! Each frame is one newline-terminated JSON object (see
//! `lanlink_core::protocol::envelope`). A [`Connection`] owns the write half
//! and the table of in-flight calls keyed by token; [`spawn_receive_loop`]
//! drives the read half, settling replies and dispatching named messages to
//! registered handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use lanlink_core::{Envelope, PeerEndpoint, ProtocolError, TokenCounter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::runtime::{wait_with_timeout, Completion, FutureError, Scheduler};

/// Errors produced while sending on or waiting for a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("reply decode failed: {0}")]
    Decode(String),
}

struct PendingReply {
    name: String,
    reply: Completion<Value>,
}

/// One established peer connection: the write half plus the table of calls
/// awaiting a reply.
pub struct Connection {
    endpoint: PeerEndpoint,
    hostname: String,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    tokens: TokenCounter,
    pending: StdMutex<HashMap<u64, PendingReply>>,
}

impl Connection {
    pub fn new(
        endpoint: PeerEndpoint,
        hostname: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            endpoint,
            hostname: hostname.into(),
            writer: Mutex::new(Box::new(writer)),
            tokens: TokenCounter::new(),
            pending: StdMutex::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self) -> PeerEndpoint {
        self.endpoint
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Number of calls still waiting on a reply.
    pub fn outstanding_calls(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sends a named message without requesting a reply.
    ///
    /// # Errors
    ///
    /// Fails if the payload uses a reserved field name or the socket write
    /// fails.
    pub async fn post_message(
        &self,
        name: &str,
        payload: Map<String, Value>,
    ) -> Result<(), ChannelError> {
        let line = Envelope::new(name, payload).encode_line()?;
        self.write_line(&line).await
    }

    /// Sends a named message carrying a fresh token and returns the handle
    /// that resolves when the peer's reply arrives. The frame is fully
    /// flushed before this returns.
    ///
    /// # Errors
    ///
    /// Fails if the payload uses a reserved field name or the socket write
    /// fails. On a write failure the pending entry is rolled back so the
    /// token table does not leak.
    pub async fn send_message(
        &self,
        name: &str,
        payload: Map<String, Value>,
    ) -> Result<Completion<Value>, ChannelError> {
        let token = self.tokens.next();
        let reply = Completion::new();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(
                token,
                PendingReply {
                    name: name.to_owned(),
                    reply: reply.clone(),
                },
            );
        }

        let line = match Envelope::with_token(name, token, payload).encode_line() {
            Ok(line) => line,
            Err(err) => {
                self.forget_token(token);
                return Err(err.into());
            }
        };
        if let Err(err) = self.write_line(&line).await {
            self.forget_token(token);
            return Err(err);
        }
        Ok(reply)
    }

    /// Sends a tokened message and waits up to `limit` for the reply,
    /// decoding it into `T`.
    ///
    /// # Errors
    ///
    /// Fails on send errors, a remote error reply, a reply that does not
    /// decode as `T`, or when `limit` elapses first.
    pub async fn call<T: DeserializeOwned>(
        &self,
        name: &str,
        payload: Map<String, Value>,
        limit: Duration,
    ) -> Result<T, ChannelError> {
        let reply = self.send_message(name, payload).await?;
        let value = wait_with_timeout(&reply, limit)
            .await
            .map_err(|err| match err {
                FutureError::Failed(message) => ChannelError::Remote(message),
                FutureError::TimedOut(elapsed) => ChannelError::Timeout(elapsed),
            })?;
        serde_json::from_value(value).map_err(|err| ChannelError::Decode(err.to_string()))
    }

    /// Writes one already-framed line to the socket and flushes it.
    pub(crate) async fn write_line(&self, line: &str) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Resolves the pending call registered under `token`. Replies for
    /// unknown tokens are dropped; the caller may have already timed out
    /// and discarded its handle.
    pub(crate) fn settle_reply(&self, token: u64, result: Result<Value, String>) {
        let entry = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&token)
        };
        let Some(entry) = entry else {
            debug!(token, "reply for unknown token dropped");
            return;
        };
        match result {
            Ok(value) => {
                entry.reply.complete(value);
            }
            Err(message) => {
                debug!(token, name = %entry.name, %message, "remote reported call failure");
                entry.reply.fail(message);
            }
        }
    }

    fn forget_token(&self, token: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&token);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("hostname", &self.hostname)
            .field("outstanding_calls", &self.outstanding_calls())
            .finish()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// An async handler for one named message. Receives the connection the
/// message arrived on and the payload fields; its return value becomes the
/// reply when the sender asked for one.
pub type MessageHandler = Arc<
    dyn Fn(Arc<Connection>, Map<String, Value>) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

/// Maps message names to their handlers. Shared by every connection.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for messages named `name`, replacing any
    /// previous registration.
    pub fn register(&self, name: &str, handler: MessageHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(name.to_owned(), handler);
    }

    /// Registers a handler that deserializes the payload into `P` and
    /// serializes its `R` result back into the reply value.
    pub fn register_typed<P, R, F, Fut>(&self, name: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize,
        F: Fn(Arc<Connection>, P) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(
            name,
            Arc::new(move |connection, payload| {
                let handler = Arc::clone(&handler);
                async move {
                    let request: P = serde_json::from_value(Value::Object(payload))
                        .map_err(|err| anyhow::anyhow!("payload decode failed: {err}"))?;
                    let response = handler(connection, request).await?;
                    serde_json::to_value(response)
                        .map_err(|err| anyhow::anyhow!("reply encode failed: {err}"))
                }
                .boxed()
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<MessageHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(name).map(Arc::clone)
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

/// Spawns the read-side loop for `connection`.
///
/// Each received line is decoded off the async workers. Reply frames settle
/// their pending call; named messages are dispatched to the registry, with
/// handler outcomes sent back as reply frames when the sender attached a
/// token. A malformed line is treated as a broken peer and tears the
/// connection down. When the loop ends for any reason `on_close` runs with
/// the peer's endpoint; in-flight calls stay unsettled, so callers bound
/// their waits themselves.
pub fn spawn_receive_loop<R>(
    connection: Arc<Connection>,
    reader: R,
    handlers: Arc<HandlerRegistry>,
    scheduler: Scheduler,
    on_close: impl FnOnce(PeerEndpoint) + Send + 'static,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let endpoint = connection.endpoint();
    let loop_scheduler = scheduler.clone();
    scheduler.spawn("channel-receive", async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(%endpoint, "peer closed the channel");
                    break;
                }
                Err(err) => {
                    warn!(%endpoint, error = %err, "channel read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            // Frames can be large; decode away from the async workers.
            let decoded = loop_scheduler
                .run_in_thread(move || Envelope::decode_line(&line))
                .await;
            let envelope = match decoded {
                Ok(Ok(envelope)) => envelope,
                Ok(Err(err)) => {
                    error!(%endpoint, error = %err, "malformed frame, closing channel");
                    break;
                }
                Err(err) => {
                    error!(%endpoint, error = %err, "frame decode aborted, closing channel");
                    break;
                }
            };

            if envelope.is_result() {
                match envelope.result_parts() {
                    Ok((token, outcome)) => connection.settle_reply(token, outcome),
                    Err(err) => {
                        // A bad reply frame loses one message, not the peer.
                        warn!(%endpoint, error = %err, "reply frame dropped");
                    }
                }
                continue;
            }

            dispatch(
                &loop_scheduler,
                &handlers,
                Arc::clone(&connection),
                envelope,
            );
        }
        on_close(endpoint);
        Ok(())
    });
}

fn dispatch(
    scheduler: &Scheduler,
    handlers: &HandlerRegistry,
    connection: Arc<Connection>,
    envelope: Envelope,
) {
    let Some(handler) = handlers.get(&envelope.name) else {
        warn!(endpoint = %connection.endpoint(), name = %envelope.name, "no handler for message");
        return;
    };
    let Envelope { name, token, payload } = envelope;
    scheduler.spawn("channel-dispatch", async move {
        let outcome = handler(Arc::clone(&connection), payload).await;
        match (token, outcome) {
            (Some(token), Ok(value)) => {
                let line = Envelope::result_ok(token, value).encode_line()?;
                connection.write_line(&line).await?;
            }
            (Some(token), Err(err)) => {
                let line = Envelope::result_err(token, format!("{err:#}")).encode_line()?;
                connection.write_line(&line).await?;
            }
            (None, Ok(_)) => {}
            (None, Err(err)) => {
                warn!(
                    endpoint = %connection.endpoint(),
                    name = %name,
                    error = %format!("{err:#}"),
                    "handler failed for untokened message"
                );
            }
        }
        Ok(())
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;

    fn endpoint() -> SocketAddr {
        "192.168.1.20:9888".parse().unwrap()
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_post_message_writes_one_framed_line() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connection = Connection::new(endpoint(), "peer-a", client);

        connection
            .post_message("ClipboardChanged", payload(json!({"Kind": "text"})))
            .await
            .unwrap();

        let mut lines = BufReader::new(&mut server).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"_Message_":"ClipboardChanged","Kind":"text"}"#);
    }

    #[tokio::test]
    async fn test_send_message_registers_pending_and_settle_resolves_it() {
        let (client, _server) = tokio::io::duplex(4096);
        let connection = Connection::new(endpoint(), "peer-a", client);

        let reply = connection
            .send_message("Ping", Map::new())
            .await
            .unwrap();
        assert_eq!(connection.outstanding_calls(), 1);

        connection.settle_reply(1, Ok(json!("pong")));
        assert_eq!(connection.outstanding_calls(), 0);
        assert_eq!(reply.wait().await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_settle_reply_for_unknown_token_is_a_no_op() {
        let (client, _server) = tokio::io::duplex(4096);
        let connection = Connection::new(endpoint(), "peer-a", client);
        connection.settle_reply(99, Ok(json!("ghost")));
        assert_eq!(connection.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_send_message_rolls_back_pending_on_write_failure() {
        let (client, server) = tokio::io::duplex(16);
        drop(server);
        let connection = Connection::new(endpoint(), "peer-a", client);

        // The duplex peer is gone, so flushing the frame fails.
        let result = connection
            .send_message("Ping", payload(json!({"Filler": "x".repeat(64)})))
            .await;
        assert!(result.is_err());
        assert_eq!(connection.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_registry_typed_handler_round_trips_payload() {
        #[derive(serde::Deserialize)]
        struct Echo {
            #[serde(rename = "Text")]
            text: String,
        }

        let registry = HandlerRegistry::new();
        registry.register_typed("Echo", |_conn, request: Echo| async move {
            Ok(request.text.to_uppercase())
        });

        let handler = registry.get("Echo").unwrap();
        let (client, _server) = tokio::io::duplex(64);
        let connection = Arc::new(Connection::new(endpoint(), "peer-a", client));
        let value = handler(connection, payload(json!({"Text": "hi"})))
            .await
            .unwrap();
        assert_eq!(value, json!("HI"));
    }

    #[tokio::test]
    async fn test_registry_lookup_misses_unregistered_name() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("Nope").is_none());
    }
}
