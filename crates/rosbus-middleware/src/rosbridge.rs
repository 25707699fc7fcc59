//! [`Connection`] over a `rosbridge_server` WebSocket.
//!
//! Speaks the JSON op protocol of rosbridge v2:
//!
//! | Op | Direction | Fields |
//! |---|---|---|
//! | `advertise` | out | `id`, `topic`, `type` |
//! | `publish` | out / in | `topic`, `msg` |
//! | `unadvertise` | out | `id`, `topic` |
//! | `subscribe` | out | `id`, `topic`, `type` |
//! | `unsubscribe` | out | `id`, `topic` |
//! | `status` | in | `level`, `msg` |
//!
//! A writer task owns the socket sink and drains a queue of outgoing frames;
//! a reader task fans inbound `publish` frames out to every local
//! subscription on the topic.  The bridge sends one copy per topic per
//! client, so demultiplexing happens here.  Each subscription runs its
//! callback on its own delivery task, so a slow callback never stalls the
//! reader.
//!
//! There is no reconnection: once the socket closes, every handle and factory
//! call fails with [`BusError::NotConnected`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rosbus_types::{BusError, ConnectionEvent, Message};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connection::{Callback, Connection, Publisher, Subscription};

/// A live connection to a rosbridge endpoint.  Clones share the socket.
#[derive(Clone)]
pub struct RosbridgeConnection {
    inner: Arc<BridgeInner>,
}

enum Outgoing {
    Frame(String),
    Close,
}

struct BridgeInner {
    url: String,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    /// topic -> subscription id -> delivery queue
    routes: Mutex<HashMap<String, HashMap<String, mpsc::UnboundedSender<Message>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    connected: AtomicBool,
}

impl RosbridgeConnection {
    /// Open a WebSocket to `url` (e.g. `"ws://localhost:9090"`).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Transport`] when the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| BusError::Transport(format!("connect to {url}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel();
        let inner = Arc::new(BridgeInner::new(url, outgoing));

        let writer = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(item) = queue.recv().await {
                let frame = match item {
                    Outgoing::Frame(text) => WsMessage::Text(text.into()),
                    Outgoing::Close => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = ws_tx.send(frame).await {
                    error!(url = %writer.url, error = %e, "rosbridge write failed");
                    writer.emit(ConnectionEvent::Error(e.to_string()));
                    break;
                }
            }
            writer.shut_down();
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => reader.dispatch(text.as_str()),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(url = %reader.url, error = %e, "rosbridge read failed");
                        reader.emit(ConnectionEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            reader.shut_down();
        });

        inner.emit(ConnectionEvent::Connected);
        debug!(url = %url, "rosbridge connected");
        Ok(Self { inner })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Send a close frame.  The reader and writer tasks wind down and a
    /// [`ConnectionEvent::Closed`] is emitted.
    pub fn close(&self) {
        let _ = self.inner.outgoing.send(Outgoing::Close);
    }
}

impl BridgeInner {
    fn new(url: &str, outgoing: mpsc::UnboundedSender<Outgoing>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            url: url.to_string(),
            outgoing,
            routes: Mutex::new(HashMap::new()),
            events,
            connected: AtomicBool::new(true),
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, frame: Value) -> Result<(), BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        self.outgoing
            .send(Outgoing::Frame(frame.to_string()))
            .map_err(|_| BusError::NotConnected)
    }

    /// Mark the socket dead and drop every route.  Runs once.
    fn shut_down(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.routes.lock().clear();
            debug!(url = %self.url, "rosbridge closed");
            self.emit(ConnectionEvent::Closed);
        }
    }

    /// Handle one inbound text frame.
    fn dispatch(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring malformed rosbridge frame");
                return;
            }
        };

        match frame.get("op").and_then(Value::as_str) {
            Some("publish") => {
                let Some(topic) = frame.get("topic").and_then(Value::as_str) else {
                    return;
                };
                let message = match frame.get("msg").cloned().map(Message::try_from) {
                    Some(Ok(message)) => message,
                    _ => {
                        warn!(topic = %topic, "ignoring publish frame without an object payload");
                        return;
                    }
                };
                let routes = self.routes.lock();
                if let Some(queues) = routes.get(topic) {
                    for queue in queues.values() {
                        let _ = queue.send(message.clone());
                    }
                }
            }
            Some("status") => {
                let level = frame.get("level").and_then(Value::as_str).unwrap_or("");
                let text = frame.get("msg").and_then(Value::as_str).unwrap_or("");
                if level == "error" {
                    warn!(url = %self.url, status = %text, "rosbridge reported an error");
                    self.emit(ConnectionEvent::Error(text.to_string()));
                }
            }
            other => debug!(op = ?other, "ignoring rosbridge frame"),
        }
    }
}

fn request_id(op: &str, topic: &str) -> String {
    format!("{op}:{topic}:{}", Uuid::new_v4())
}

#[async_trait]
impl Connection for RosbridgeConnection {
    async fn create_publisher(
        &self,
        name: &str,
        message_type: &str,
    ) -> Result<Arc<dyn Publisher>, BusError> {
        let id = request_id("advertise", name);
        self.inner.send(json!({
            "op": "advertise",
            "id": id,
            "topic": name,
            "type": message_type,
        }))?;
        Ok(Arc::new(RosbridgePublisher {
            name: name.to_string(),
            message_type: message_type.to_string(),
            id,
            bridge: Arc::clone(&self.inner),
            open: AtomicBool::new(true),
        }))
    }

    async fn create_subscription(
        &self,
        name: &str,
        message_type: &str,
        callback: Callback,
    ) -> Result<Arc<dyn Subscription>, BusError> {
        let id = request_id("subscribe", name);
        let (queue, mut inbox) = mpsc::unbounded_channel::<Message>();
        let delivery = callback.clone();
        // Ends once the route is dropped, or is aborted by `unsubscribe`.
        let task = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                delivery.call(message);
            }
        });
        self.inner
            .routes
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(id.clone(), queue);
        let sent = self.inner.send(json!({
            "op": "subscribe",
            "id": id,
            "topic": name,
            "type": message_type,
        }));
        if let Err(e) = sent {
            remove_route(&self.inner, name, &id);
            task.abort();
            return Err(e);
        }
        Ok(Arc::new(RosbridgeSubscription {
            name: name.to_string(),
            id,
            callback,
            bridge: Arc::clone(&self.inner),
            task: tokio::sync::Mutex::new(Some(task)),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

fn remove_route(bridge: &BridgeInner, topic: &str, id: &str) {
    let mut routes = bridge.routes.lock();
    if let Some(queues) = routes.get_mut(topic) {
        queues.remove(id);
        if queues.is_empty() {
            routes.remove(topic);
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

struct RosbridgePublisher {
    name: String,
    message_type: String,
    id: String,
    bridge: Arc<BridgeInner>,
    open: AtomicBool,
}

#[async_trait]
impl Publisher for RosbridgePublisher {
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn message_type(&self) -> &str {
        &self.message_type
    }

    async fn publish(&self, message: Message) -> Result<(), BusError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BusError::HandleClosed(self.name.clone()));
        }
        self.bridge.send(json!({
            "op": "publish",
            "topic": self.name,
            "msg": message,
        }))
    }

    async fn unadvertise(&self) -> Result<(), BusError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BusError::HandleClosed(self.name.clone()));
        }
        self.bridge.send(json!({
            "op": "unadvertise",
            "id": self.id,
            "topic": self.name,
        }))
    }
}

struct RosbridgeSubscription {
    name: String,
    id: String,
    callback: Callback,
    bridge: Arc<BridgeInner>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Subscription for RosbridgeSubscription {
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn callback(&self) -> &Callback {
        &self.callback
    }

    async fn unsubscribe(&self) -> Result<(), BusError> {
        let Some(task) = self.task.lock().await.take() else {
            return Err(BusError::HandleClosed(self.name.clone()));
        };
        remove_route(&self.bridge, &self.name, &self.id);
        task.abort();
        // Joining guarantees no delivery is still running once we return.
        let _ = task.await;
        // A closed socket has already dropped the remote registration.
        if let Err(e) = self.bridge.send(json!({
            "op": "unsubscribe",
            "id": self.id,
            "topic": self.name,
        })) {
            debug!(topic = %self.name, error = %e, "unsubscribe frame not sent");
        }
        Ok(())
    }
}
