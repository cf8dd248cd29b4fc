//! Chrome DevTools Protocol client over WebSocket
//!
//! Features:
//! - Auto-incrementing command IDs, responses correlated by ID
//! - Per-command timeout
//! - Flattened target sessions (`sessionId` on commands and events)
//! - Events fanned out to subscribed handlers from a background reader

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type Handlers = Arc<Mutex<Vec<EventHandler>>>;

/// Callback invoked for every protocol event. Runs on the reader task, so it
/// must return quickly.
pub type EventHandler = Arc<dyn Fn(&CdpEvent) + Send + Sync>;

/// A protocol event (a message with `method` and no `id`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    /// Target session the event belongs to; `None` for browser-level events.
    pub session_id: Option<String>,
}

/// DevTools connection to one browser.
pub struct CdpConnection {
    sink: AsyncMutex<SplitSink<WsStream, Message>>,
    pending: Pending,
    handlers: Handlers,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl CdpConnection {
    /// Connect to a browser's `ws://…/devtools/browser/…` endpoint.
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, response) = connect_async(url)
            .await
            .context("DevTools WebSocket connection failed")?;
        debug!("DevTools connected: {:?}", response.status());

        let (sink, source) = stream.split();
        let pending = Pending::default();
        let handlers = Handlers::default();
        let reader = tokio::spawn(read_loop(source, pending.clone(), handlers.clone()));

        Ok(Self {
            sink: AsyncMutex::new(sink),
            pending,
            handlers,
            next_id: AtomicU64::new(0),
            reader,
        })
    }

    /// Register an event handler. Handlers see events for every session.
    pub fn subscribe(&self, handler: EventHandler) {
        self.handlers.lock().push(handler);
    }

    /// Send a command and wait for its result.
    ///
    /// `session_id` targets a page session attached with `flatten: true`.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = command(id, method, params, session_id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let sent = self
            .sink
            .lock()
            .await
            .send(Message::Text(request.to_string()))
            .await;
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(anyhow::Error::new(e).context(format!("Failed to send CDP command '{method}'")));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.with_context(|| format!("CDP command '{method}' failed")),
            Ok(Err(_)) => Err(anyhow!(
                "DevTools connection closed while waiting for '{method}'"
            )),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(anyhow!(
                    "Timeout ({timeout:?}) waiting for CDP response to '{method}'"
                ))
            }
        }
    }

    /// [`call`](Self::call) and deserialize the result.
    pub async fn call_typed<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<R> {
        let result = self.call(method, params, session_id, timeout).await?;
        serde_json::from_value(result)
            .with_context(|| format!("Failed to deserialize result of '{method}'"))
    }

    /// Close the WebSocket. Outstanding calls fail once the reader stops.
    pub async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("DevTools close: {e}");
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn command(id: u64, method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut request = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(session_id) = session_id {
        request["sessionId"] = json!(session_id);
    }
    request
}

async fn read_loop(mut source: SplitStream<WsStream>, pending: Pending, handlers: Handlers) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch(&text, &pending, &handlers),
            Ok(Message::Close(frame)) => {
                debug!("DevTools closed: {:?}", frame);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("DevTools receive failed: {e}");
                break;
            }
        }
    }
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().clear();
}

/// Route one incoming message to its waiting caller or to the event handlers.
fn dispatch(text: &str, pending: &Pending, handlers: &Handlers) {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid JSON from DevTools: {e}");
            return;
        }
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let Some(tx) = pending.lock().remove(&id) else {
            return;
        };
        let result = match message.get("error") {
            Some(error) => Err(anyhow!("CDP error: {error}")),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
        return;
    }

    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return;
    };
    let event = CdpEvent {
        method: method.to_string(),
        params: message.get("params").cloned().unwrap_or(Value::Null),
        session_id: message
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    // Clone out so a handler can subscribe without deadlocking.
    let handlers = handlers.lock().clone();
    for handler in &handlers {
        handler(&event);
    }
}
