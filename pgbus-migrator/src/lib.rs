//! SQL schema migrations for the pgbus message broker.
//!
//! This crate provides the PostgreSQL schema required by `pgbus`: topics,
//! messages, scheduled messages, subscriptions, and per-subscription message
//! state. Applied migrations are recorded in sqlx_migrator's registry table,
//! and concurrent processes serialize on its transactional advisory lock, so
//! bootstrapping the schema from several hosts at once is safe.
//!
//! # Usage
//!
//! The main entry point is the [`new`] function, which creates a
//! [`Migrator`](sqlx_migrator::Migrator) configured with all pgbus migrations.
//!
//! ```rust,ignore
//! use sqlx_migrator::{Migrate, Plan};
//!
//! let mut conn = pool.acquire().await?;
//! let migrator = pgbus_migrator::new()?;
//! migrator.run(&mut *conn, &Plan::apply_all()).await?;
//! ```
//!
//! `pgbus::Broker::open` runs this automatically; depend on this crate
//! directly only when you want to manage schema rollout yourself.
//!
//! # Database schema
//!
//! After running all migrations, the database contains:
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `pgbus_topics` | Topic registry with per-topic retention |
//! | `pgbus_messages` | Message payloads, ordered by ULID id |
//! | `pgbus_scheduled_messages` | Cron-driven message templates |
//! | `pgbus_subscriptions` | Subscription config and the sequential gate |
//! | `pgbus_subscription_messages` | Per-(subscription, message) delivery state |
//!
//! plus the `pgbus_message_status` enum
//! (`waiting | processing | completed | failed`).

use sqlx_migrator::{Info, Migrator};

mod m0001;

pub use m0001::InitSchema;

/// Creates a new [`Migrator`] with all pgbus migrations registered.
///
/// # Errors
///
/// Returns an error if migration registration fails.
pub fn new() -> Result<Migrator<sqlx::Postgres>, sqlx_migrator::Error> {
    let mut migrator = Migrator::default();
    migrator.add_migration(Box::new(InitSchema))?;

    Ok(migrator)
}
