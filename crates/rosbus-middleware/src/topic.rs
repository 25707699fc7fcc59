//! Typed topic handles layered over a single [`Connection`].
//!
//! A [`Topic`] binds one `(name, message_type)` pair to a connection.  It
//! lazily advertises at most one [`Publisher`] and tracks any number of
//! [`Subscription`]s keyed by [`Callback`] identity.  Every operation returns
//! immediately with a [`Completion`] the caller may await or drop.
//!
//! # Publisher side
//!
//! ```text
//! Unadvertised --advertise()--> Advertising --(resolve)--> Advertised
//!      ^                            |                          |
//!      +-------(reject)-------------+                          |
//!      +---------------------unadvertise()---------------------+
//! ```
//!
//! Each advertisement generation owns an *advertiser* task.  The task awaits
//! [`Connection::create_publisher`] and then drains a FIFO outbox of publish
//! and unadvertise commands, so messages published while the advertisement
//! is in flight reach the transport in call order.  A new generation does
//! not call `create_publisher` until the previous advertiser has released
//! its handle.
//!
//! # Subscriber side
//!
//! Every `subscribe` call carries a request id from a monotonically
//! increasing counter.  A resolution whose id no longer matches the slot for
//! its callback (superseded by a second `subscribe`, unsubscribed while in
//! flight, or outliving the topic) is unsubscribed on the spot, so no
//! subscription handle is ever left registered without an owner.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rosbus_types::{BusError, Message};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::{Callback, Completion, Connection, Publisher, Subscription};

/// Observable publisher-side state of a [`Topic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherStatus {
    Unadvertised,
    /// A `create_publisher` request is in flight.
    Advertising,
    Advertised,
}

/// A named, typed channel bound to one connection.
///
/// Dropping a `Topic` releases everything it owns: the publisher is
/// unadvertised once it resolves and every subscription, pending or active,
/// is unsubscribed.
pub struct Topic {
    inner: Arc<TopicInner>,
}

struct TopicInner {
    name: String,
    message_type: String,
    connection: Arc<dyn Connection>,
    runtime: Handle,
    state: Mutex<TopicState>,
}

#[derive(Default)]
struct TopicState {
    publisher: PublisherState,
    generation: u64,
    next_request: u64,
    subscriptions: HashMap<Callback, SubscriptionSlot>,
    /// Waiters for in-flight subscribe requests that were abandoned before
    /// resolving, keyed by request id.
    retired: HashMap<u64, Vec<oneshot::Sender<()>>>,
    /// Resolves once the latest advertiser task has exited.
    advertiser_exit: Option<oneshot::Receiver<()>>,
}

#[derive(Default)]
enum PublisherState {
    #[default]
    Unadvertised,
    Advertising {
        generation: u64,
        outbox: mpsc::UnboundedSender<Outbound>,
    },
    Advertised {
        outbox: mpsc::UnboundedSender<Outbound>,
    },
}

enum Outbound {
    Publish {
        message: Message,
        done: oneshot::Sender<()>,
    },
    /// Acknowledged once every earlier command has been handled.
    Flush { done: oneshot::Sender<()> },
    Unadvertise { done: oneshot::Sender<()> },
}

struct SubscriptionSlot {
    request: u64,
    handle: Option<Arc<dyn Subscription>>,
}

impl Topic {
    /// Bind `name` and `message_type` to `connection`.
    ///
    /// Must be called from within a Tokio runtime; the topic spawns its
    /// background work onto that runtime.
    ///
    /// # Errors
    ///
    /// * [`BusError::InvalidTopic`] when `name` or `message_type` is empty.
    /// * [`BusError::NoRuntime`] when called outside a Tokio runtime.
    pub fn new(
        connection: Arc<dyn Connection>,
        name: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Result<Self, BusError> {
        let name = name.into();
        let message_type = message_type.into();
        if name.is_empty() {
            return Err(BusError::InvalidTopic("topic name must not be empty".to_string()));
        }
        if message_type.is_empty() {
            return Err(BusError::InvalidTopic(format!(
                "message type for {name} must not be empty"
            )));
        }
        let runtime = Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        Ok(Self {
            inner: Arc::new(TopicInner {
                name,
                message_type,
                connection,
                runtime,
                state: Mutex::new(TopicState::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn message_type(&self) -> &str {
        &self.inner.message_type
    }

    pub fn publisher_status(&self) -> PublisherStatus {
        match self.inner.state.lock().publisher {
            PublisherState::Unadvertised => PublisherStatus::Unadvertised,
            PublisherState::Advertising { .. } => PublisherStatus::Advertising,
            PublisherState::Advertised { .. } => PublisherStatus::Advertised,
        }
    }

    /// Number of callbacks currently registered, pending or active.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    pub fn is_subscribed(&self, callback: &Callback) -> bool {
        self.inner.state.lock().subscriptions.contains_key(callback)
    }

    // -----------------------------------------------------------------------
    // Publisher side
    // -----------------------------------------------------------------------

    /// Request a publisher unless one is already pending or resolved.
    ///
    /// The returned completion resolves once the advertisement has settled,
    /// successfully or not.
    pub fn advertise(&self) -> Completion {
        let (done, settled) = oneshot::channel();
        self.enqueue(Outbound::Flush { done });
        Completion::signalled(settled)
    }

    /// Publish `message`, advertising first if needed.
    ///
    /// Messages are forwarded in call order.  Transport failures are logged
    /// and never surfaced here; the completion resolves either way.
    pub fn publish(&self, message: Message) -> Completion {
        let (done, forwarded) = oneshot::channel();
        self.enqueue(Outbound::Publish { message, done });
        Completion::signalled(forwarded)
    }

    /// Release the publisher, if any.
    ///
    /// State returns to [`PublisherStatus::Unadvertised`] immediately, so the
    /// next `publish` advertises from scratch.  The old handle is unadvertised
    /// after it resolves and after any messages already queued on it; a new
    /// advertisement is not requested until that has happened.
    pub fn unadvertise(&self) -> Completion {
        let mut state = self.inner.state.lock();
        match std::mem::take(&mut state.publisher) {
            PublisherState::Unadvertised => Completion::ready(),
            PublisherState::Advertising { outbox, .. }
            | PublisherState::Advertised { outbox, .. } => {
                debug!(topic = %self.inner.name, "unadvertising");
                let (done, released) = oneshot::channel();
                // A send error means the advertiser already exited; `done`
                // is dropped with the command and the completion resolves.
                let _ = outbox.send(Outbound::Unadvertise { done });
                Completion::signalled(released)
            }
        }
    }

    fn enqueue(&self, command: Outbound) {
        let mut state = self.inner.state.lock();
        if matches!(state.publisher, PublisherState::Unadvertised) {
            self.start_advertising(&mut state);
        }
        match &state.publisher {
            PublisherState::Advertising { outbox, .. } | PublisherState::Advertised { outbox, .. } => {
                let _ = outbox.send(command);
            }
            PublisherState::Unadvertised => {}
        }
    }

    fn start_advertising(&self, state: &mut TopicState) {
        state.generation += 1;
        let generation = state.generation;
        let (outbox, commands) = mpsc::unbounded_channel();
        let (exited, exit) = oneshot::channel();
        let previous = state.advertiser_exit.replace(exit);
        state.publisher = PublisherState::Advertising { generation, outbox };
        debug!(topic = %self.inner.name, generation, "advertising");
        self.inner.runtime.spawn(run_advertiser(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.connection),
            self.inner.name.clone(),
            self.inner.message_type.clone(),
            Generation {
                id: generation,
                previous,
                exited,
            },
            commands,
        ));
    }

    // -----------------------------------------------------------------------
    // Subscriber side
    // -----------------------------------------------------------------------

    /// Register `callback` for inbound messages on this topic.
    ///
    /// Subscribing a callback that is already registered replaces its
    /// registration; the superseded handle is unsubscribed.  The completion
    /// resolves once the connection has answered the request.
    pub fn subscribe(&self, callback: Callback) -> Completion {
        let request = {
            let mut state = self.inner.state.lock();
            state.next_request += 1;
            let request = state.next_request;
            let slot = SubscriptionSlot { request, handle: None };
            if let Some(previous) = state.subscriptions.insert(callback.clone(), slot) {
                debug!(topic = %self.inner.name, request, superseded = previous.request, "resubscribing");
                // Teardown of the superseded handle is not part of this
                // request's completion.
                drop(self.inner.retire(&mut state, previous));
            }
            request
        };

        let (done, resolved) = oneshot::channel();
        self.inner.runtime.spawn(run_subscriber(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.connection),
            self.inner.name.clone(),
            self.inner.message_type.clone(),
            callback,
            request,
            done,
        ));
        Completion::signalled(resolved)
    }

    /// Unregister `callback`, or every callback when `None`.
    ///
    /// Unknown callbacks are ignored.  The completion resolves once the
    /// removed handles have been unsubscribed, including handles that were
    /// still pending when this was called.
    pub fn unsubscribe(&self, callback: Option<&Callback>) -> Completion {
        let mut state = self.inner.state.lock();
        match callback {
            Some(callback) => match state.subscriptions.remove(callback) {
                Some(slot) => self.inner.retire(&mut state, slot),
                None => Completion::ready(),
            },
            None => {
                let slots: Vec<SubscriptionSlot> =
                    state.subscriptions.drain().map(|(_, slot)| slot).collect();
                let releases: Vec<Completion> = slots
                    .into_iter()
                    .map(|slot| self.inner.retire(&mut state, slot))
                    .collect();
                Completion::all(releases)
            }
        }
    }

    /// Unadvertise and unsubscribe everything, then drop the topic.
    pub fn close(self) -> Completion {
        Completion::all([self.unadvertise(), self.unsubscribe(None)])
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.inner.name)
            .field("message_type", &self.inner.message_type)
            .field("publisher", &self.publisher_status())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl TopicInner {
    /// Take ownership of a slot that has left the subscription map.
    fn retire(&self, state: &mut TopicState, slot: SubscriptionSlot) -> Completion {
        let (done, released) = oneshot::channel();
        match slot.handle {
            Some(handle) => {
                let name = self.name.clone();
                self.runtime.spawn(async move {
                    release_subscription(&name, handle).await;
                    let _ = done.send(());
                });
            }
            // Still in flight: the subscriber task releases it on resolution.
            None => state.retired.entry(slot.request).or_default().push(done),
        }
        Completion::signalled(released)
    }

    fn mark_advertised(&self, generation: u64) {
        let mut state = self.state.lock();
        state.publisher = match std::mem::take(&mut state.publisher) {
            PublisherState::Advertising { generation: current, outbox } if current == generation => {
                PublisherState::Advertised { outbox }
            }
            other => other,
        };
    }

    fn reset_publisher(&self, generation: u64) {
        let mut state = self.state.lock();
        if matches!(
            state.publisher,
            PublisherState::Advertising { generation: current, .. } if current == generation
        ) {
            state.publisher = PublisherState::Unadvertised;
        }
    }
}

impl Drop for TopicInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        // Dropping the outbox ends the advertiser, which unadvertises its
        // handle.  Pending subscriptions release themselves on resolution.
        state.publisher = PublisherState::Unadvertised;
        for (_, slot) in state.subscriptions.drain() {
            if let Some(handle) = slot.handle {
                let name = self.name.clone();
                self.runtime.spawn(async move {
                    release_subscription(&name, handle).await;
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// One advertisement attempt, chained behind the one before it.
struct Generation {
    id: u64,
    /// Exit signal of the previous advertiser, if it may still be running.
    previous: Option<oneshot::Receiver<()>>,
    /// Dropped when this advertiser exits.
    exited: oneshot::Sender<()>,
}

async fn run_advertiser(
    topic: Weak<TopicInner>,
    connection: Arc<dyn Connection>,
    name: String,
    message_type: String,
    generation: Generation,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
) {
    let Generation {
        id: generation,
        previous,
        exited: _exited,
    } = generation;
    // At most one publisher request or handle exists at a time: wait until
    // the previous generation has released its handle.
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let publisher = match connection.create_publisher(&name, &message_type).await {
        Ok(publisher) => publisher,
        Err(e) => {
            if let Some(topic) = topic.upgrade() {
                topic.reset_publisher(generation);
            }
            commands.close();
            let mut dropped = 0usize;
            while let Some(command) = commands.recv().await {
                if matches!(command, Outbound::Publish { .. }) {
                    dropped += 1;
                }
            }
            warn!(topic = %name, error = %e, dropped, "advertise failed");
            return;
        }
    };

    if let Some(topic) = topic.upgrade() {
        topic.mark_advertised(generation);
    }
    debug!(topic = %name, generation, "advertised");

    while let Some(command) = commands.recv().await {
        match command {
            Outbound::Publish { message, done } => {
                if let Err(e) = publisher.publish(message).await {
                    warn!(topic = %name, error = %e, "publish failed");
                }
                let _ = done.send(());
            }
            Outbound::Flush { done } => {
                let _ = done.send(());
            }
            Outbound::Unadvertise { done } => {
                release_publisher(&name, publisher.as_ref()).await;
                let _ = done.send(());
                return;
            }
        }
    }

    // Every sender is gone without an unadvertise: the topic was dropped.
    release_publisher(&name, publisher.as_ref()).await;
}

async fn run_subscriber(
    topic: Weak<TopicInner>,
    connection: Arc<dyn Connection>,
    name: String,
    message_type: String,
    callback: Callback,
    request: u64,
    done: oneshot::Sender<()>,
) {
    let result = connection
        .create_subscription(&name, &message_type, callback.clone())
        .await;

    let Some(owner) = topic.upgrade() else {
        if let Ok(handle) = result {
            debug!(topic = %name, request, "topic dropped before subscription resolved");
            release_subscription(&name, handle).await;
        }
        return;
    };

    match result {
        Ok(handle) => {
            let stale = {
                let mut state = owner.state.lock();
                match state.subscriptions.get_mut(&callback) {
                    Some(slot) if slot.request == request => {
                        slot.handle = Some(Arc::clone(&handle));
                        None
                    }
                    _ => Some(state.retired.remove(&request).unwrap_or_default()),
                }
            };
            drop(owner);

            match stale {
                None => debug!(topic = %name, request, "subscribed"),
                Some(waiters) => {
                    debug!(topic = %name, request, "releasing superseded subscription");
                    release_subscription(&name, handle).await;
                    for waiter in waiters {
                        let _ = waiter.send(());
                    }
                }
            }
        }
        Err(e) => {
            warn!(topic = %name, error = %e, "subscribe failed");
            let mut state = owner.state.lock();
            if state
                .subscriptions
                .get(&callback)
                .is_some_and(|slot| slot.request == request)
            {
                state.subscriptions.remove(&callback);
            }
            state.retired.remove(&request);
        }
    }

    let _ = done.send(());
}

async fn release_publisher(name: &str, publisher: &dyn Publisher) {
    match publisher.unadvertise().await {
        Ok(()) => debug!(topic = %name, "unadvertised"),
        Err(e) => warn!(topic = %name, error = %e, "unadvertise failed"),
    }
}

async fn release_subscription(name: &str, handle: Arc<dyn Subscription>) {
    match handle.unsubscribe().await {
        Ok(()) => debug!(topic = %name, "unsubscribed"),
        Err(e) => warn!(topic = %name, error = %e, "unsubscribe failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rosbus_types::ConnectionEvent;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Semaphore, broadcast};

    // -----------------------------------------------------------------------
    // Mock connection
    // -----------------------------------------------------------------------

    /// Connection whose factory calls can be held back and released one at a
    /// time, so tests can interleave resolutions deterministically.
    struct MockConnection {
        events: broadcast::Sender<ConnectionEvent>,
        publisher_gate: Semaphore,
        subscription_gate: Semaphore,
        fail_publishers: AtomicBool,
        fail_subscriptions: AtomicBool,
        publishers: Mutex<Vec<Arc<MockPublisher>>>,
        subscriptions: Mutex<Vec<Arc<MockSubscription>>>,
    }

    impl MockConnection {
        fn new() -> Arc<Self> {
            Self::build(Semaphore::MAX_PERMITS, Semaphore::MAX_PERMITS)
        }

        fn gated() -> Arc<Self> {
            Self::build(0, 0)
        }

        fn build(publisher_permits: usize, subscription_permits: usize) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                events,
                publisher_gate: Semaphore::new(publisher_permits),
                subscription_gate: Semaphore::new(subscription_permits),
                fail_publishers: AtomicBool::new(false),
                fail_subscriptions: AtomicBool::new(false),
                publishers: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            })
        }

        fn publisher(&self, index: usize) -> Arc<MockPublisher> {
            Arc::clone(&self.publishers.lock()[index])
        }

        fn subscription(&self, index: usize) -> Arc<MockSubscription> {
            Arc::clone(&self.subscriptions.lock()[index])
        }

        fn publisher_requests(&self) -> usize {
            self.publishers.lock().len()
        }

        fn subscription_requests(&self) -> usize {
            self.subscriptions.lock().len()
        }

        fn live_subscriptions(&self) -> usize {
            self.subscriptions
                .lock()
                .iter()
                .filter(|s| !s.closed.load(Ordering::SeqCst))
                .count()
        }

        /// Deliver `message` to every live subscription on `name`.
        fn deliver(&self, name: &str, message: Message) {
            let live: Vec<Arc<MockSubscription>> = self
                .subscriptions
                .lock()
                .iter()
                .filter(|s| s.name == name && !s.closed.load(Ordering::SeqCst))
                .cloned()
                .collect();
            for subscription in live {
                subscription.callback.call(message.clone());
            }
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn create_publisher(
            &self,
            name: &str,
            message_type: &str,
        ) -> Result<Arc<dyn Publisher>, BusError> {
            let publisher = Arc::new(MockPublisher {
                name: name.to_string(),
                message_type: message_type.to_string(),
                sent: Mutex::new(Vec::new()),
                unadvertised: AtomicUsize::new(0),
            });
            // Record the request before waiting so tests can count it.
            self.publishers.lock().push(Arc::clone(&publisher));
            if let Ok(permit) = self.publisher_gate.acquire().await {
                permit.forget();
            }
            if self.fail_publishers.load(Ordering::SeqCst) {
                return Err(BusError::NotConnected);
            }
            Ok(publisher)
        }

        async fn create_subscription(
            &self,
            name: &str,
            _message_type: &str,
            callback: Callback,
        ) -> Result<Arc<dyn Subscription>, BusError> {
            let subscription = Arc::new(MockSubscription {
                name: name.to_string(),
                callback,
                closed: AtomicBool::new(false),
                unsubscribed: AtomicUsize::new(0),
            });
            self.subscriptions.lock().push(Arc::clone(&subscription));
            if let Ok(permit) = self.subscription_gate.acquire().await {
                permit.forget();
            }
            if self.fail_subscriptions.load(Ordering::SeqCst) {
                subscription.closed.store(true, Ordering::SeqCst);
                return Err(BusError::NotConnected);
            }
            Ok(subscription)
        }

        fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
            self.events.subscribe()
        }
    }

    struct MockPublisher {
        name: String,
        message_type: String,
        sent: Mutex<Vec<Message>>,
        unadvertised: AtomicUsize,
    }

    impl MockPublisher {
        fn sent(&self) -> Vec<Message> {
            self.sent.lock().clone()
        }

        fn unadvertise_calls(&self) -> usize {
            self.unadvertised.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Publisher for MockPublisher {
        fn topic_name(&self) -> &str {
            &self.name
        }

        fn message_type(&self) -> &str {
            &self.message_type
        }

        async fn publish(&self, message: Message) -> Result<(), BusError> {
            if self.unadvertised.load(Ordering::SeqCst) > 0 {
                return Err(BusError::HandleClosed(self.name.clone()));
            }
            self.sent.lock().push(message);
            Ok(())
        }

        async fn unadvertise(&self) -> Result<(), BusError> {
            self.unadvertised.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A subscription is "live" while it is not closed.  It counts as live
    /// even before the connection hands it back, just as a transport-level
    /// registration would.
    struct MockSubscription {
        name: String,
        callback: Callback,
        closed: AtomicBool,
        unsubscribed: AtomicUsize,
    }

    impl MockSubscription {
        fn unsubscribe_calls(&self) -> usize {
            self.unsubscribed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Subscription for MockSubscription {
        fn topic_name(&self) -> &str {
            &self.name
        }

        fn callback(&self) -> &Callback {
            &self.callback
        }

        async fn unsubscribe(&self) -> Result<(), BusError> {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn topic_on(conn: &Arc<MockConnection>) -> Topic {
        let connection: Arc<dyn Connection> = conn.clone();
        Topic::new(connection, "/chatter", "std_msgs/String").unwrap()
    }

    fn text(data: &str) -> Message {
        Message::new().with("data", data)
    }

    fn counting_callback() -> (Callback, Arc<Mutex<Vec<Message>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let callback = Callback::new(move |message| sink.lock().push(message));
        (callback, received)
    }

    /// Yield to background tasks until `condition` holds.
    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn new_rejects_empty_name_and_type() {
        let conn = MockConnection::new();
        let connection: Arc<dyn Connection> = conn.clone();
        assert!(matches!(
            Topic::new(Arc::clone(&connection), "", "std_msgs/String"),
            Err(BusError::InvalidTopic(_))
        ));
        assert!(matches!(
            Topic::new(connection, "/chatter", ""),
            Err(BusError::InvalidTopic(_))
        ));
    }

    #[test]
    fn new_outside_runtime_fails() {
        let conn = MockConnection::new();
        let connection: Arc<dyn Connection> = conn;
        assert!(matches!(
            Topic::new(connection, "/chatter", "std_msgs/String"),
            Err(BusError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn accessors_report_binding() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        assert_eq!(topic.name(), "/chatter");
        assert_eq!(topic.message_type(), "std_msgs/String");
        assert_eq!(topic.publisher_status(), PublisherStatus::Unadvertised);
        assert_eq!(topic.subscription_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Publisher side
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn repeated_advertise_issues_one_request() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);

        let first = topic.advertise();
        let second = topic.advertise();
        topic.advertise().await;
        first.await;
        second.await;

        assert_eq!(conn.publisher_requests(), 1);
        assert_eq!(topic.publisher_status(), PublisherStatus::Advertised);
        let publisher = conn.publisher(0);
        assert_eq!(publisher.topic_name(), "/chatter");
        assert_eq!(publisher.message_type(), "std_msgs/String");
    }

    #[tokio::test]
    async fn publishes_queued_while_advertising_keep_order() {
        let conn = MockConnection::gated();
        let topic = topic_on(&conn);

        let pending: Vec<Completion> = (1..=5)
            .map(|i| topic.publish(text(&format!("m{i}"))))
            .collect();
        assert_eq!(topic.publisher_status(), PublisherStatus::Advertising);

        conn.publisher_gate.add_permits(1);
        Completion::all(pending).await;

        assert_eq!(conn.publisher_requests(), 1);
        let expected: Vec<Message> = (1..=5).map(|i| text(&format!("m{i}"))).collect();
        assert_eq!(conn.publisher(0).sent(), expected);
    }

    #[tokio::test]
    async fn publish_after_advertised_forwards() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        topic.advertise().await;

        topic.publish(text("a")).await;
        topic.publish(text("b")).await;

        assert_eq!(conn.publisher(0).sent(), vec![text("a"), text("b")]);
    }

    #[tokio::test]
    async fn unadvertise_twice_releases_handle_once() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        topic.advertise().await;

        topic.unadvertise().await;
        topic.unadvertise().await;

        assert_eq!(conn.publisher(0).unadvertise_calls(), 1);
        assert_eq!(topic.publisher_status(), PublisherStatus::Unadvertised);
    }

    #[tokio::test]
    async fn unadvertise_without_publisher_is_noop() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        topic.unadvertise().await;
        assert_eq!(conn.publisher_requests(), 0);
    }

    #[tokio::test]
    async fn publish_after_unadvertise_readvertises() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);

        topic.advertise().await;
        topic.unadvertise().await;
        topic.publish(text("again")).await;

        assert_eq!(conn.publisher_requests(), 2);
        assert!(conn.publisher(0).sent().is_empty());
        assert_eq!(conn.publisher(1).sent(), vec![text("again")]);
        assert_eq!(conn.publisher(1).unadvertise_calls(), 0);
    }

    #[tokio::test]
    async fn unadvertise_while_advertising_waits_for_resolution() {
        let conn = MockConnection::gated();
        let topic = topic_on(&conn);

        let queued = topic.publish(text("before"));
        let released = topic.unadvertise();
        assert_eq!(topic.publisher_status(), PublisherStatus::Unadvertised);
        eventually(|| conn.publisher_requests() == 1).await;
        assert_eq!(conn.publisher(0).unadvertise_calls(), 0);

        conn.publisher_gate.add_permits(1);
        queued.await;
        released.await;

        let publisher = conn.publisher(0);
        assert_eq!(publisher.sent(), vec![text("before")]);
        assert_eq!(publisher.unadvertise_calls(), 1);
    }

    #[tokio::test]
    async fn readvertise_waits_for_previous_handle_release() {
        let conn = MockConnection::gated();
        let topic = topic_on(&conn);

        let first = topic.publish(text("m1"));
        let released = topic.unadvertise();
        let second = topic.publish(text("m2"));
        eventually(|| conn.publisher_requests() == 1).await;
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.publisher_requests(), 1);

        conn.publisher_gate.add_permits(1);
        first.await;
        released.await;
        assert_eq!(conn.publisher(0).unadvertise_calls(), 1);

        eventually(|| conn.publisher_requests() == 2).await;
        conn.publisher_gate.add_permits(1);
        second.await;

        assert_eq!(conn.publisher(0).sent(), vec![text("m1")]);
        assert_eq!(conn.publisher(1).sent(), vec![text("m2")]);
        assert_eq!(conn.publisher(1).unadvertise_calls(), 0);
        assert_eq!(topic.publisher_status(), PublisherStatus::Advertised);
    }

    #[tokio::test]
    async fn advertise_failure_drops_messages_and_allows_retry() {
        let conn = MockConnection::new();
        conn.fail_publishers.store(true, Ordering::SeqCst);
        let topic = topic_on(&conn);

        topic.publish(text("lost")).await;
        assert_eq!(topic.publisher_status(), PublisherStatus::Unadvertised);
        assert!(conn.publisher(0).sent().is_empty());

        conn.fail_publishers.store(false, Ordering::SeqCst);
        topic.publish(text("delivered")).await;

        assert_eq!(conn.publisher_requests(), 2);
        assert_eq!(conn.publisher(1).sent(), vec![text("delivered")]);
    }

    // -----------------------------------------------------------------------
    // Subscriber side
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unsubscribe_all_releases_every_handle() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        let (cb1, _) = counting_callback();
        let (cb2, _) = counting_callback();

        topic.subscribe(cb1).await;
        topic.subscribe(cb2).await;
        assert_eq!(topic.subscription_count(), 2);

        topic.unsubscribe(None).await;

        assert_eq!(topic.subscription_count(), 0);
        assert_eq!(conn.subscription(0).unsubscribe_calls(), 1);
        assert_eq!(conn.subscription(1).unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_callback_is_noop() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        let (cb, _) = counting_callback();
        let (stranger, _) = counting_callback();

        topic.unsubscribe(None).await;
        topic.subscribe(cb.clone()).await;
        topic.unsubscribe(Some(&stranger)).await;

        assert!(topic.is_subscribed(&cb));
        assert_eq!(conn.subscription(0).unsubscribe_calls(), 0);
    }

    #[tokio::test]
    async fn double_subscribe_leaves_no_orphan() {
        let conn = MockConnection::gated();
        let topic = topic_on(&conn);
        let (cb, _) = counting_callback();

        let first = topic.subscribe(cb.clone());
        let second = topic.subscribe(cb.clone());
        assert_eq!(topic.subscription_count(), 1);

        conn.subscription_gate.add_permits(2);
        first.await;
        second.await;

        assert_eq!(conn.subscription_requests(), 2);
        assert_eq!(conn.live_subscriptions(), 1);
        assert_eq!(conn.subscription(0).unsubscribe_calls(), 1);
        assert_eq!(conn.subscription(1).unsubscribe_calls(), 0);
        assert!(topic.is_subscribed(&cb));
    }

    #[tokio::test]
    async fn resubscribe_replaces_active_handle() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        let (cb, received) = counting_callback();

        topic.subscribe(cb.clone()).await;
        topic.subscribe(cb.clone()).await;
        eventually(|| conn.subscription(0).unsubscribe_calls() == 1).await;

        conn.deliver("/chatter", text("once"));
        assert_eq!(received.lock().len(), 1);
        assert_eq!(conn.live_subscriptions(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_before_resolution_releases_late_handle() {
        let conn = MockConnection::gated();
        let topic = topic_on(&conn);
        let (cb, _) = counting_callback();

        let subscribed = topic.subscribe(cb.clone());
        let released = topic.unsubscribe(Some(&cb));
        assert_eq!(topic.subscription_count(), 0);

        conn.subscription_gate.add_permits(1);
        subscribed.await;
        released.await;

        assert_eq!(conn.subscription(0).unsubscribe_calls(), 1);
        assert_eq!(conn.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_registers_nothing() {
        let conn = MockConnection::new();
        conn.fail_subscriptions.store(true, Ordering::SeqCst);
        let topic = topic_on(&conn);
        let (cb, received) = counting_callback();

        topic.subscribe(cb.clone()).await;

        assert!(!topic.is_subscribed(&cb));
        conn.deliver("/chatter", text("ignored"));
        assert!(received.lock().is_empty());
    }

    #[tokio::test]
    async fn delivery_stops_after_unsubscribe() {
        let conn = MockConnection::new();
        let connection: Arc<dyn Connection> = conn.clone();
        let topic = Topic::new(connection, "/ns/diag", "diag/Array").unwrap();
        let (cb, received) = counting_callback();

        topic.subscribe(cb.clone()).await;
        let payload = Message::try_from(json!({ "status": [{ "name": "a", "level": 0 }] })).unwrap();
        conn.deliver("/ns/diag", payload.clone());
        assert_eq!(*received.lock(), vec![payload.clone()]);

        topic.unsubscribe(Some(&cb)).await;
        conn.deliver("/ns/diag", payload);
        assert_eq!(received.lock().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn close_releases_publisher_and_subscriptions() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        let (cb, _) = counting_callback();
        topic.advertise().await;
        topic.subscribe(cb).await;

        topic.close().await;

        assert_eq!(conn.publisher(0).unadvertise_calls(), 1);
        assert_eq!(conn.subscription(0).unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn dropping_topic_releases_active_handles() {
        let conn = MockConnection::new();
        let topic = topic_on(&conn);
        let (cb, _) = counting_callback();
        topic.advertise().await;
        topic.subscribe(cb).await;

        drop(topic);

        eventually(|| {
            conn.publisher(0).unadvertise_calls() == 1 && conn.subscription(0).unsubscribe_calls() == 1
        })
        .await;
    }

    #[tokio::test]
    async fn dropping_topic_releases_handles_that_resolve_later() {
        let conn = MockConnection::gated();
        let topic = topic_on(&conn);
        let (cb, _) = counting_callback();
        let _ = topic.advertise();
        let _ = topic.subscribe(cb);
        eventually(|| conn.publisher_requests() == 1 && conn.subscription_requests() == 1).await;

        drop(topic);
        conn.publisher_gate.add_permits(1);
        conn.subscription_gate.add_permits(1);

        eventually(|| {
            conn.publisher(0).unadvertise_calls() == 1 && conn.subscription(0).unsubscribe_calls() == 1
        })
        .await;
        assert_eq!(conn.live_subscriptions(), 0);
    }
}
