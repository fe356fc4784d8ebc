//! Initial schema migration.
//!
//! Creates the `pgbus_message_status` enum, the five broker tables, and the
//! indexes the reservation and trim queries rely on. Later migrations build
//! on this baseline; it is never edited in place.

mod message;
mod message_status;
mod scheduled_message;
mod subscription;
mod subscription_message;
mod topic;

use sqlx_migrator::vec_box;

/// Initial migration that creates the core pgbus schema.
///
/// Database objects, in creation order:
///
/// - `pgbus_message_status` - delivery status enum
/// - `pgbus_topics` - topic registry (`name` unique, `max_retention` where
///   `NULL` means keep everything)
/// - `pgbus_messages` - payload storage; the 26-char ULID primary key is the
///   canonical total order within a topic
/// - `pgbus_scheduled_messages` - cron templates, unique per `(topic_id, name)`
/// - `pgbus_subscriptions` - subscription config plus the `processing`
///   sequential gate, unique per `(topic_id, name)`
/// - `pgbus_subscription_messages` - per-(subscription, message) state rows,
///   cascade-deleted with either parent
pub struct InitSchema;

sqlx_migrator::postgres_migration!(
    InitSchema,
    "pgbus",
    "init_schema",
    vec_box![],
    vec_box![
        message_status::create_type::Operation,
        topic::create_table::Operation,
        message::create_table::Operation,
        message::create_topic_idx::Operation,
        scheduled_message::create_table::Operation,
        subscription::create_table::Operation,
        subscription_message::create_table::Operation,
        subscription_message::create_reserve_idx::Operation,
    ]
);
