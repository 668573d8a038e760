//! Liveness probing between connected peers.
//!
//! `Ping` is the simplest message in the system and doubles as the smoke
//! test for the whole channel: a tokened `Ping` exercises framing, handler
//! dispatch, and reply correlation end to end.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::debug;

use crate::infrastructure::network::{ChannelError, Connection, HandlerRegistry};

pub const PING_MESSAGE: &str = "Ping";
const PONG: &str = "pong";

/// Registers the presence handlers.
pub fn register(handlers: &HandlerRegistry) {
    handlers.register(
        PING_MESSAGE,
        Arc::new(|connection, _payload| {
            async move {
                debug!(endpoint = %connection.endpoint(), "ping received");
                Ok(Value::String(PONG.to_owned()))
            }
            .boxed()
        }),
    );
}

/// Pings `connection`, waiting at most `limit` for the pong.
///
/// # Errors
///
/// Fails when the send fails, the peer reports an error, or no reply
/// arrives within `limit`.
pub async fn ping(connection: &Connection, limit: Duration) -> Result<(), ChannelError> {
    let reply: String = connection.call(PING_MESSAGE, Map::new(), limit).await?;
    if reply != PONG {
        return Err(ChannelError::Decode(format!(
            "unexpected ping reply {reply:?}"
        )));
    }
    Ok(())
}
