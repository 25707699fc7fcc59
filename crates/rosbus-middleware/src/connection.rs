//! The capability surface a [`Topic`][crate::topic::Topic] needs from the
//! underlying message-bus connection.
//!
//! A topic never speaks to a transport directly.  It asks a [`Connection`]
//! for a [`Publisher`] or a [`Subscription`] and drives those handles.
//!
//! # Overview
//!
//! - [`Connection`] – factory for publisher and subscription handles, plus a
//!   lifecycle event channel.
//! - [`Publisher`] – an advertised outgoing topic.
//! - [`Subscription`] – one inbound registration bound to a [`Callback`].
//! - [`Callback`] – identity-comparable message handler.
//! - [`Completion`] – awaitable result of a fire-and-forget topic operation.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future::{self, BoxFuture};
use rosbus_types::{BusError, ConnectionEvent, Message};
use tokio::sync::{broadcast, oneshot};

/// Every message-bus connection must implement this trait.
///
/// # Contract
///
/// * `create_publisher` – advertises `name` with `message_type` and returns a
///   live handle, or fails (e.g. not connected, conflicting type).  May be
///   called concurrently for different topics.
///
/// * `create_subscription` – registers `callback` for inbound traffic on
///   `name`.  Several subscriptions on the same name with different callbacks
///   each receive every message independently.
///
/// * `events` – a fresh receiver of [`ConnectionEvent`]s.  Pending factory
///   calls must fail rather than hang once the connection closes.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_publisher(
        &self,
        name: &str,
        message_type: &str,
    ) -> Result<Arc<dyn Publisher>, BusError>;

    async fn create_subscription(
        &self,
        name: &str,
        message_type: &str,
        callback: Callback,
    ) -> Result<Arc<dyn Subscription>, BusError>;

    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// An advertised outgoing topic.
///
/// Once [`unadvertise`][Publisher::unadvertise] has been called the handle is
/// dead: both methods return [`BusError::HandleClosed`].
#[async_trait]
pub trait Publisher: Send + Sync {
    fn topic_name(&self) -> &str;

    fn message_type(&self) -> &str;

    async fn publish(&self, message: Message) -> Result<(), BusError>;

    async fn unadvertise(&self) -> Result<(), BusError>;
}

/// One active inbound registration.
///
/// After [`unsubscribe`][Subscription::unsubscribe] resolves, the callback is
/// never invoked through this handle again and a second call returns
/// [`BusError::HandleClosed`].
#[async_trait]
pub trait Subscription: Send + Sync {
    fn topic_name(&self) -> &str;

    fn callback(&self) -> &Callback;

    async fn unsubscribe(&self) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

/// A message handler with stable identity.
///
/// Clones share identity and compare equal; two callbacks built from separate
/// [`Callback::new`] calls never do, even if they wrap the same function.
/// Keep a clone around to unsubscribe later.
///
/// Connections invoke the handler from a Tokio task, so it should return
/// quickly and must not block on async work.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(Message) + Send + Sync>);

impl Callback {
    pub fn new(f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Invoke the handler.
    pub fn call(&self, message: Message) {
        (self.0)(message)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Callback {}

impl Hash for Callback {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:#x})", self.addr())
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Resolves when a topic operation has reached the transport.
///
/// Topic operations never block; awaiting the returned `Completion` is opt-in.
/// Dropping it does not cancel the work.  A `Completion` resolves even when
/// the operation failed, since failures are reported on the connection's
/// event channel and in the logs, not to the caller.
pub struct Completion(BoxFuture<'static, ()>);

impl Completion {
    /// An already-resolved completion.
    pub fn ready() -> Self {
        Self(Box::pin(future::ready(())))
    }

    /// Resolves once every completion in `completions` has.
    pub fn all(completions: impl IntoIterator<Item = Completion>) -> Self {
        let pending: Vec<Completion> = completions.into_iter().collect();
        Self::new(async move {
            future::join_all(pending).await;
        })
    }

    pub(crate) fn new(fut: impl Future<Output = ()> + Send + 'static) -> Self {
        Self(Box::pin(fut))
    }

    /// Resolves when `done` fires or its sender is dropped.
    pub(crate) fn signalled(done: oneshot::Receiver<()>) -> Self {
        Self::new(async move {
            let _ = done.await;
        })
    }
}

impl Future for Completion {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.0.as_mut().poll(cx)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}
