//! In-process [`Connection`] built on Tokio broadcast channels.
//!
//! Every topic name gets its own broadcast lane, created on first use, so a
//! slow subscriber on one topic never blocks traffic on another.  Publishers
//! and subscriptions created through the same [`LoopbackConnection`] talk to
//! each other directly, which makes it the connection of choice for tests,
//! simulations and single-process deployments.
//!
//! | Operation | Effect |
//! |---|---|
//! | `create_publisher` | Binds the lane's message type (first caller wins). |
//! | `create_subscription` | Spawns a delivery task feeding the callback. |
//! | [`LoopbackConnection::inject`] | Delivers a message as if it came from a remote peer. |
//! | [`LoopbackConnection::close`] | Drops every lane; factories fail with [`BusError::NotConnected`]. |

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rosbus_types::{BusError, ConnectionEvent, Message};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{Callback, Connection, Publisher, Subscription};

/// Default lane capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Shared in-process connection.  Clone it cheaply – all clones share the
/// same lanes.
#[derive(Clone)]
pub struct LoopbackConnection {
    inner: Arc<LoopbackInner>,
}

struct LoopbackInner {
    capacity: usize,
    lanes: Mutex<HashMap<String, Lane>>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
}

struct Lane {
    message_type: String,
    sender: broadcast::Sender<Message>,
}

impl LoopbackConnection {
    /// Create a new connection with the given per-lane capacity.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(16);
        let connection = Self {
            inner: Arc::new(LoopbackInner {
                capacity,
                lanes: Mutex::new(HashMap::new()),
                events,
                closed: AtomicBool::new(false),
            }),
        };
        connection.inner.emit(ConnectionEvent::Connected);
        connection
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Deliver `message` on `name` as if a remote peer had published it.
    ///
    /// Returns the number of subscriptions that were handed the message.
    /// `Ok(0)` means nobody is listening, which is not an error.
    pub fn inject(&self, name: &str, message: Message) -> Result<usize, BusError> {
        self.inner.send(name, message)
    }

    /// Tear the connection down.
    ///
    /// Delivery tasks end, existing publishers start failing and every later
    /// factory call returns [`BusError::NotConnected`].  Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.lanes.lock().clear();
        debug!("loopback connection closed");
        self.inner.emit(ConnectionEvent::Closed);
    }
}

impl Default for LoopbackConnection {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LoopbackInner {
    fn emit(&self, event: ConnectionEvent) {
        // No observers is a normal condition.
        let _ = self.events.send(event);
    }

    /// Find or create the lane for `name`, enforcing a single message type.
    fn lane(&self, name: &str, message_type: &str) -> Result<broadcast::Sender<Message>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(name.to_string()).or_insert_with(|| Lane {
            message_type: message_type.to_string(),
            sender: broadcast::channel(self.capacity).0,
        });
        if lane.message_type != message_type {
            let err = BusError::TypeMismatch {
                topic: name.to_string(),
                advertised: lane.message_type.clone(),
                requested: message_type.to_string(),
            };
            self.emit(ConnectionEvent::Error(err.to_string()));
            return Err(err);
        }
        Ok(lane.sender.clone())
    }

    fn send(&self, name: &str, message: Message) -> Result<usize, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::NotConnected);
        }
        let lanes = self.lanes.lock();
        let Some(lane) = lanes.get(name) else {
            return Ok(0);
        };
        Ok(lane.sender.send(message).unwrap_or(0))
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn create_publisher(
        &self,
        name: &str,
        message_type: &str,
    ) -> Result<Arc<dyn Publisher>, BusError> {
        self.inner.lane(name, message_type)?;
        debug!(topic = %name, message_type = %message_type, "loopback advertise");
        Ok(Arc::new(LoopbackPublisher {
            name: name.to_string(),
            message_type: message_type.to_string(),
            connection: Arc::clone(&self.inner),
            open: AtomicBool::new(true),
        }))
    }

    async fn create_subscription(
        &self,
        name: &str,
        message_type: &str,
        callback: Callback,
    ) -> Result<Arc<dyn Subscription>, BusError> {
        let mut receiver = self.inner.lane(name, message_type)?.subscribe();
        let topic = name.to_string();
        let delivery = callback.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => delivery.call(message),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %topic, lagged_by = n, "loopback subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        debug!(topic = %name, "loopback subscribe");
        Ok(Arc::new(LoopbackSubscription {
            name: name.to_string(),
            callback,
            task: tokio::sync::Mutex::new(Some(task)),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

struct LoopbackPublisher {
    name: String,
    message_type: String,
    connection: Arc<LoopbackInner>,
    open: AtomicBool,
}

#[async_trait]
impl Publisher for LoopbackPublisher {
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
        self.connection.send(&self.name, message).map(|_| ())
    }

    async fn unadvertise(&self) -> Result<(), BusError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BusError::HandleClosed(self.name.clone()));
        }
        Ok(())
    }
}

struct LoopbackSubscription {
    name: String,
    callback: Callback,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Subscription for LoopbackSubscription {
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
        task.abort();
        // Joining guarantees no delivery is still running once we return.
        let _ = task.await;
        Ok(())
    }
}
