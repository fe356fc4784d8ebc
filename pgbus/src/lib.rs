//! # pgbus
//!
//! A PostgreSQL-backed message broker exposing three messaging shapes behind
//! one API: job queues (parallel work distribution), ordered event logs
//! (sequential replay), and pub/sub fan-out. The database is the only
//! coordination point: no external broker, no leader election, every decision
//! a committed transaction.
//!
//! # How it works
//!
//! Each topic stores messages ordered by a time-ordered ULID id. Subscribing
//! fans messages out into per-subscription state rows, and consumers reserve
//! work with `FOR UPDATE SKIP LOCKED`, so any number of processes can compete
//! for the same subscription without double delivery. Sequential
//! subscriptions add a row-locked gate so handlers run strictly one at a
//! time across the whole fleet. Background sweeps reopen messages whose
//! consumer stopped heartbeating, trim acknowledged backlog past the
//! retention cap, and materialize cron schedules.
//!
//! Delivery is at-least-once with idempotent completion; retries, delays,
//! priorities, and scheduled emissions all feed the same reservation query.
//!
//! # Example
//!
//! ```rust,ignore
//! use pgbus::{Broker, BrokerOptions, SendOptions, SubscribeOptions};
//!
//! let broker = Broker::open(BrokerOptions::new(std::env::var("DATABASE_URL")?)).await?;
//! let orders = broker.topic("orders").await?;
//!
//! let subscription = orders
//!     .subscribe_with("billing", SubscribeOptions::default().parallel().max_attempts(3))
//!     .await?;
//!
//! let consumer = subscription.consume(pgbus::handler_fn(|delivery| async move {
//!     let order: Order = delivery.data()?;
//!     // charge the card...
//!     Ok(())
//! }));
//!
//! orders.send(Order { id: 42 }, SendOptions::default()).await?;
//!
//! consumer.wait_idle().await;
//! broker.close().await?;
//! ```

mod broker;
mod consumer;
mod error;
mod message;
mod scheduler;
mod stale;
mod subscription;
mod topic;
mod trim;

pub use broker::{Broker, BrokerOptions};
pub use consumer::{handler_fn, Consumer, ConsumerEvent, ConsumerOptions, Handler};
pub use error::{Error, Result};
pub use message::{Delivery, Message, MessageStatus, SendOptions, SubscriptionMessage};
pub use scheduler::{ScheduleOptions, ScheduledMessage};
pub use stale::StaleEvent;
pub use subscription::{
    ConsumptionMode, RetryStrategy, StartPosition, SubscribeOptions, Subscription,
};
pub use topic::{Topic, TopicOptions};
