//! # courier-core
//!
//! In-process publish/subscribe message bus with cursor replay.
//!
//! This crate provides the building blocks:
//!
//! - **Store** - Bounded per-topic ring of messages with monotonic ids
//! - **Topic** - A named stream: one store plus its subscriptions
//! - **Subscription** - Per-subscriber cursors and the delivery loop
//! - **Engine** - Worker pool that drains subscriptions with pending messages
//! - **Bus** - The facade tying publish, subscribe and cursors together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish  ┌─────────────┐  append   ┌─────────────┐
//! │  Publisher  │──────────▶│ MessageBus  │──────────▶│ Topic/Store │
//! └─────────────┘           └─────────────┘           └─────────────┘
//!                                  │ schedule                ▲ fetch
//!                                  ▼                         │
//!                           ┌─────────────┐   work    ┌─────────────┐
//!                           │   Engine    │──────────▶│Subscription │──▶ handler
//!                           └─────────────┘           └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use courier_core::{BusConfig, BusError, MessageBus, MessageResult, Subscriber};
//!
//! # async fn run() -> Result<(), BusError> {
//! let bus = MessageBus::new(BusConfig::default())?;
//! let handle = bus.subscribe(
//!     &Subscriber::new("conn-1", ["chat"]),
//!     None,
//!     None,
//!     |result: MessageResult| async move {
//!         println!("{} messages, resume with {}", result.total_count, result.cursor);
//!         Ok::<_, BusError>(true)
//!     },
//! )?;
//!
//! bus.publish("server", "chat", "hello")?;
//! handle.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod message;
pub mod store;
pub mod subscription;
pub mod topic;

pub use bus::{BusStats, MessageBus, Subscriber, SubscriptionHandle};
pub use config::BusConfig;
pub use counters::{Counter, CounterSink, Counters, MetricsSink, NoopSink};
pub use engine::{Engine, EngineConfig};
pub use error::{BusError, ConfigError, CounterError};
pub use message::{Message, MessageId};
pub use store::{MessageStore, StoreRead};
pub use subscription::{
    Cursor, CursorForm, MessageFetcher, MessageHandler, MessageResult, StoreFetcher, Subscription,
};
pub use topic::Topic;
