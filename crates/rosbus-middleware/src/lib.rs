//! `rosbus-middleware` – typed topics over a single message-bus connection.
//!
//! Hides the asynchronous, possibly failing advertise/subscribe handshakes of
//! a robotics message bridge behind a small, non-blocking [`Topic`] API.
//!
//! # Modules
//!
//! - [`connection`] – the capability surface a topic needs from a
//!   connection: [`Connection`], [`Publisher`], [`Subscription`], plus
//!   [`Callback`] and [`Completion`].
//! - [`topic`] – the [`Topic`] state machine: lazy single publisher,
//!   identity-keyed subscriptions, leak-free teardown.
//! - [`loopback`] – in-process connection on Tokio broadcast channels.
//! - [`rosbridge`] – connection to a `rosbridge_server` WebSocket.

pub mod connection;
pub mod loopback;
pub mod rosbridge;
pub mod topic;

pub use connection::{Callback, Completion, Connection, Publisher, Subscription};
pub use loopback::LoopbackConnection;
pub use rosbridge::RosbridgeConnection;
pub use topic::{PublisherStatus, Topic};
