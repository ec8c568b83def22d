//! # MQTT Wrapper Module
//!
//! Thin convenience layer over `rumqttc`. The client library does the protocol
//! work (framing, QoS, keep-alive, reconnects); this module adds:
//! - `{basetopic}` substitution in every topic passed in
//! - a subscription table that remembers callbacks and sends deferred
//!   subscriptions once the broker connection is up
//! - routing of incoming messages to the first subscription whose pattern
//!   (`+` one level, `#` the rest) covers the message topic
//! - fire-and-forget publishing with JSON encoding of structured payloads
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection settings and defaults
//! ├── error.rs            - Error type, logged at the boundary
//! ├── topic.rs            - Basetopic templates and pattern matching
//! ├── subscription.rs     - Subscription entries and the ordered table
//! ├── message_manager.rs  - Outgoing payloads and decoded arrivals
//! ├── session.rs          - Connection state and event handling
//! └── mqtt_handler.rs     - Worker task, handle and client library glue
//! ```
//!
//! ## Error Handling
//!
//! Nothing fails towards the caller. Refused requests, lost connections and
//! payloads that cannot be encoded are logged and otherwise ignored.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod session;
pub mod subscription;
pub mod topic;

pub use config::MqttConfig;
pub use error::MqttError;
pub use message_manager::{ArrivedMessage, Payload};
pub use mqtt_handler::{MqttHandle, SubscriptionHandle};
pub use subscription::SubscribeOptions;

use std::sync::OnceLock;

static INSTANCE: OnceLock<MqttHandle> = OnceLock::new();

/// Process-wide wrapper instance.
///
/// The first call spawns the wrapper from `config`; later calls return the
/// same handle and ignore their argument. Must be called inside a tokio runtime.
pub fn instance(config: &MqttConfig) -> MqttHandle {
    INSTANCE.get_or_init(|| MqttHandle::spawn(config)).clone()
}
