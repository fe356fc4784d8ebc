use std::{cmp::Ordering, time::Duration};

use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    broker::Broker,
    consumer::{Consumer, ConsumerOptions, Handler},
    error::Result,
    message::{Delivery, MessageStatus, SubscriptionMessage},
};

/// How a subscription hands messages to its consumers.
///
/// `Sequential` delivers one message at a time across all processes, in
/// `(priority, id)` order, gated by the subscription row. `Parallel` lets any
/// number of consumers race for batches with skip-locked reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "lowercase")]
pub enum ConsumptionMode {
    Sequential,
    Parallel,
}

impl TryFrom<String> for ConsumptionMode {
    type Error = parse_display::ParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which messages a new subscription starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "lowercase")]
pub enum StartPosition {
    /// Backfill state rows for every message already in the topic.
    Earliest,
    /// Only messages whose insert commits after the subscription exists.
    Latest,
}

impl TryFrom<String> for StartPosition {
    type Error = parse_display::ParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Delay policy applied between handler attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr)]
#[display(style = "lowercase")]
pub enum RetryStrategy {
    /// `retry_delay` after every failure.
    Linear,
    /// `retry_delay * 2^(attempts - 1)`.
    Exponential,
}

impl TryFrom<String> for RetryStrategy {
    type Error = parse_display::ParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Configuration stored with a subscription on first creation.
///
/// The stored configuration is immutable: a later `subscribe` with different
/// options keeps the stored values (see
/// [`Subscription::config_conflict`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub mode: ConsumptionMode,
    pub start_position: StartPosition,
    pub max_attempts: i32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            mode: ConsumptionMode::Sequential,
            start_position: StartPosition::Latest,
            max_attempts: 1,
            retry_strategy: RetryStrategy::Linear,
            retry_delay: Duration::ZERO,
        }
    }
}

impl SubscribeOptions {
    pub fn mode(mut self, mode: ConsumptionMode) -> Self {
        self.mode = mode;

        self
    }

    pub fn parallel(self) -> Self {
        self.mode(ConsumptionMode::Parallel)
    }

    pub fn start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;

        self
    }

    pub fn earliest(self) -> Self {
        self.start_position(StartPosition::Earliest)
    }

    pub fn max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = attempts.max(1);

        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;

        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;

        self
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub consumption_mode: ConsumptionMode,
    #[sqlx(try_from = "String")]
    pub start_position: StartPosition,
    pub max_attempts: i32,
    #[sqlx(try_from = "String")]
    pub retry_strategy: RetryStrategy,
    pub retry_delay_ms: i64,
}

const INSERT_SUBSCRIPTION: &str = r#"
    INSERT INTO pgbus_subscriptions
        (id, topic_id, name, consumption_mode, start_position, max_attempts, retry_strategy, retry_delay_ms)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (topic_id, name) DO NOTHING
    RETURNING id, topic_id, name, consumption_mode, start_position, max_attempts, retry_strategy, retry_delay_ms;
"#;

const SELECT_SUBSCRIPTION: &str = r#"
    SELECT id, topic_id, name, consumption_mode, start_position, max_attempts, retry_strategy, retry_delay_ms
    FROM pgbus_subscriptions
    WHERE topic_id = $1 AND name = $2;
"#;

// Backfill for `earliest`: state rows for everything already committed to the
// topic, in the same transaction as the subscription insert. Visibility of
// concurrent sends is decided purely by commit order.
const BACKFILL_SUBSCRIPTION: &str = r#"
    INSERT INTO pgbus_subscription_messages
        (subscription_id, message_id, status, attempts, available_at, stale_count)
    SELECT $1, m.id, 'waiting'::pgbus_message_status, 0, m.deliver_at, 0
    FROM pgbus_messages m
    WHERE m.topic_id = $2
    ON CONFLICT DO NOTHING;
"#;

const LOCK_SUBSCRIPTION: &str = r#"
    SELECT processing FROM pgbus_subscriptions WHERE id = $1 FOR UPDATE;
"#;

const SET_PROCESSING: &str = r#"
    UPDATE pgbus_subscriptions SET processing = TRUE WHERE id = $1;
"#;

pub(crate) const CLEAR_PROCESSING: &str = r#"
    UPDATE pgbus_subscriptions SET processing = FALSE WHERE id = $1;
"#;

// Skip-locked reservation: competing consumers never block on each other and
// never receive the same row, because the inner `FOR UPDATE` holds the picked
// rows until commit while `SKIP LOCKED` routes everyone else around them.
const RESERVE_MESSAGES: &str = r#"
    UPDATE pgbus_subscription_messages sm
    SET status = 'processing', attempts = sm.attempts + 1, last_heartbeat_at = now(), progress = NULL
    FROM (
        SELECT c.subscription_id, c.message_id
        FROM pgbus_subscription_messages c
        JOIN pgbus_messages m ON m.id = c.message_id
        WHERE c.subscription_id = $1
          AND c.status = 'waiting'
          AND (c.available_at IS NULL OR c.available_at <= now())
        ORDER BY m.priority ASC NULLS LAST, m.id ASC
        LIMIT $2
        FOR UPDATE OF c SKIP LOCKED
    ) picked
    JOIN pgbus_messages m ON m.id = picked.message_id
    WHERE sm.subscription_id = picked.subscription_id AND sm.message_id = picked.message_id
    RETURNING sm.message_id, sm.attempts, sm.stale_count, m.payload, m.priority, m.created_at;
"#;

const RETRY_MESSAGE: &str = r#"
    UPDATE pgbus_subscription_messages
    SET status = 'waiting', available_at = NULL, error_stack = NULL
    WHERE subscription_id = $1 AND message_id = $2 AND status = 'failed';
"#;

const SELECT_MESSAGES: &str = r#"
    SELECT sm.subscription_id, sm.message_id, sm.status, sm.attempts, sm.available_at,
           sm.error_stack, sm.last_heartbeat_at, sm.progress, sm.stale_count, sm.created_at,
           m.payload, m.priority
    FROM pgbus_subscription_messages sm
    JOIN pgbus_messages m ON m.id = sm.message_id
    WHERE sm.subscription_id = $1
    ORDER BY m.id ASC;
"#;

const PENDING_COUNT: &str = r#"
    SELECT COUNT(*)
    FROM pgbus_subscription_messages
    WHERE subscription_id = $1
      AND status = 'waiting'
      AND (available_at IS NULL OR available_at <= now());
"#;

const DELETE_SUBSCRIPTION: &str = r#"
    DELETE FROM pgbus_subscriptions WHERE id = $1;
"#;

#[derive(Debug, sqlx::FromRow)]
struct ReservedRow {
    message_id: String,
    attempts: i32,
    stale_count: i32,
    payload: Value,
    priority: Option<i32>,
    created_at: DateTime<Utc>,
}

/// A named binding of a topic to a consumer group, with its own delivery
/// state per message.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) broker: Broker,
    pub id: Uuid,
    pub topic_id: Uuid,
    pub name: String,
    pub mode: ConsumptionMode,
    pub start_position: StartPosition,
    pub max_attempts: i32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay: Duration,
    config_conflict: bool,
}

impl Subscription {
    pub(crate) async fn create(
        broker: Broker,
        topic_id: Uuid,
        name: &str,
        options: SubscribeOptions,
    ) -> Result<Self> {
        let options = SubscribeOptions {
            max_attempts: options.max_attempts.max(1),
            ..options
        };

        let pool = broker.pool().clone();
        let mut tx = pool.begin().await?;

        let inserted: Option<SubscriptionRow> = sqlx::query_as(INSERT_SUBSCRIPTION)
            .bind(Uuid::new_v4())
            .bind(topic_id)
            .bind(name)
            .bind(options.mode.to_string())
            .bind(options.start_position.to_string())
            .bind(options.max_attempts)
            .bind(options.retry_strategy.to_string())
            .bind(options.retry_delay.as_millis() as i64)
            .fetch_optional(&mut *tx)
            .await?;

        let (row, config_conflict) = match inserted {
            Some(row) => {
                if row.start_position == StartPosition::Earliest {
                    sqlx::query(BACKFILL_SUBSCRIPTION)
                        .bind(row.id)
                        .bind(topic_id)
                        .execute(&mut *tx)
                        .await?;
                }

                (row, false)
            }
            None => {
                let row: SubscriptionRow = sqlx::query_as(SELECT_SUBSCRIPTION)
                    .bind(topic_id)
                    .bind(name)
                    .fetch_one(&mut *tx)
                    .await?;

                let stored = SubscribeOptions {
                    mode: row.consumption_mode,
                    start_position: row.start_position,
                    max_attempts: row.max_attempts,
                    retry_strategy: row.retry_strategy,
                    retry_delay: Duration::from_millis(row.retry_delay_ms as u64),
                };

                let config_conflict = stored != options;
                if config_conflict {
                    tracing::error!(
                        subscription = name,
                        "subscribe options differ from the stored configuration, keeping stored"
                    );
                }

                (row, config_conflict)
            }
        };

        tx.commit().await?;

        Ok(Self {
            broker,
            id: row.id,
            topic_id: row.topic_id,
            name: row.name,
            mode: row.consumption_mode,
            start_position: row.start_position,
            max_attempts: row.max_attempts,
            retry_strategy: row.retry_strategy,
            retry_delay: Duration::from_millis(row.retry_delay_ms as u64),
            config_conflict,
        })
    }

    /// True when this handle was obtained by re-subscribing with options that
    /// differ from the stored configuration. The stored configuration wins;
    /// the subscription stays usable.
    pub fn config_conflict(&self) -> bool {
        self.config_conflict
    }

    /// Reserves up to `limit` available messages and transitions them to
    /// `processing`.
    ///
    /// Runs in one transaction: in sequential mode the subscription row is
    /// locked first and an empty batch is returned while another message is in
    /// flight anywhere; candidates are picked in `(priority, id)` order with
    /// `FOR UPDATE SKIP LOCKED` so concurrent consumers cannot double-reserve.
    #[tracing::instrument(skip(self), fields(subscription = %self.name))]
    pub async fn reserve_next(&self, limit: usize) -> Result<Vec<Delivery>> {
        let limit = match self.mode {
            ConsumptionMode::Sequential => 1,
            ConsumptionMode::Parallel => limit,
        };

        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.broker.pool().begin().await?;

        if self.mode == ConsumptionMode::Sequential {
            let (processing,): (bool,) = sqlx::query_as(LOCK_SUBSCRIPTION)
                .bind(self.id)
                .fetch_one(&mut *tx)
                .await?;

            if processing {
                return Ok(Vec::new());
            }
        }

        let mut rows: Vec<ReservedRow> = sqlx::query_as(RESERVE_MESSAGES)
            .bind(self.id)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        if self.mode == ConsumptionMode::Sequential {
            sqlx::query(SET_PROCESSING)
                .bind(self.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        // UPDATE ... RETURNING does not preserve the subquery order.
        rows.sort_by(|a, b| reservation_order(a.priority, &a.message_id, b.priority, &b.message_id));

        tracing::debug!(reserved = rows.len(), "reserved messages");

        Ok(rows
            .into_iter()
            .map(|row| Delivery {
                subscription: self.clone(),
                events: None,
                message_id: row.message_id,
                payload: row.payload,
                priority: row.priority,
                attempts: row.attempts,
                stale_count: row.stale_count,
                created_at: row.created_at,
            })
            .collect())
    }

    /// Forces a `failed` row back to `waiting`.
    ///
    /// Clears `available_at` and `error_stack` but leaves `attempts` as-is:
    /// a retried row whose attempts already reached `max_attempts` goes
    /// straight back to `failed` on its next handler failure.
    pub async fn retry(&self, message_id: &str) -> Result<()> {
        sqlx::query(RETRY_MESSAGE)
            .bind(self.id)
            .bind(message_id)
            .execute(self.broker.pool())
            .await?;

        Ok(())
    }

    /// Returns this subscription's message state rows, earliest first,
    /// optionally filtered by status.
    pub async fn messages(&self, statuses: &[MessageStatus]) -> Result<Vec<SubscriptionMessage>> {
        let mut rows: Vec<SubscriptionMessage> = sqlx::query_as(SELECT_MESSAGES)
            .bind(self.id)
            .fetch_all(self.broker.pool())
            .await?;

        if !statuses.is_empty() {
            rows.retain(|row| statuses.contains(&row.status));
        }

        Ok(rows)
    }

    /// Number of messages currently available for reservation.
    pub async fn pending_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(PENDING_COUNT)
            .bind(self.id)
            .fetch_one(self.broker.pool())
            .await?;

        Ok(count)
    }

    /// Deletes the subscription and, by cascade, its message state rows.
    pub async fn remove(&self) -> Result<()> {
        sqlx::query(DELETE_SUBSCRIPTION)
            .bind(self.id)
            .execute(self.broker.pool())
            .await?;

        Ok(())
    }

    /// Binds a handler to this subscription and returns its consumer.
    pub fn consume<H: Handler + 'static>(&self, handler: H) -> Consumer {
        self.consume_with(handler, ConsumerOptions::default())
    }

    pub fn consume_with<H: Handler + 'static>(
        &self,
        handler: H,
        options: ConsumerOptions,
    ) -> Consumer {
        Consumer::create(self.clone(), Box::new(handler), options)
    }
}

pub(crate) fn reservation_order(
    a_priority: Option<i32>,
    a_id: &str,
    b_priority: Option<i32>,
    b_id: &str,
) -> Ordering {
    match (a_priority, b_priority) {
        (Some(a), Some(b)) => a.cmp(&b).then_with(|| a_id.cmp(b_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a_id.cmp(b_id),
    }
}

/// Delay before a failed attempt becomes available again.
///
/// `attempts` is the value after the failed reservation, so the first failure
/// of an exponential subscription waits exactly `base`.
pub(crate) fn retry_delay(strategy: RetryStrategy, base: Duration, attempts: i32) -> Duration {
    match strategy {
        RetryStrategy::Linear => base,
        RetryStrategy::Exponential => {
            let exponent = attempts.saturating_sub(1).max(0) as u32;

            base.saturating_mul(2u32.saturating_pow(exponent))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_delay_is_constant() {
        let base = Duration::from_millis(10_000);

        for attempts in 1..=5 {
            assert_eq!(retry_delay(RetryStrategy::Linear, base, attempts), base);
        }
    }

    #[test]
    fn exponential_delay_doubles_per_attempt() {
        let base = Duration::from_millis(10_000);

        assert_eq!(
            retry_delay(RetryStrategy::Exponential, base, 1),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            retry_delay(RetryStrategy::Exponential, base, 2),
            Duration::from_millis(20_000)
        );
        assert_eq!(
            retry_delay(RetryStrategy::Exponential, base, 3),
            Duration::from_millis(40_000)
        );
    }

    #[test]
    fn exponential_delay_saturates_on_large_attempts() {
        let delay = retry_delay(RetryStrategy::Exponential, Duration::from_secs(1), 200);

        assert!(delay >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn priority_orders_before_id() {
        assert_eq!(
            reservation_order(Some(1), "b", None, "a"),
            Ordering::Less,
            "prioritized beats unprioritized regardless of id"
        );
        assert_eq!(reservation_order(None, "a", None, "b"), Ordering::Less);
        assert_eq!(
            reservation_order(Some(2), "a", Some(1), "b"),
            Ordering::Greater
        );
    }

    #[test]
    fn default_options_match_documented_defaults() {
        let options = SubscribeOptions::default();

        assert_eq!(options.mode, ConsumptionMode::Sequential);
        assert_eq!(options.start_position, StartPosition::Latest);
        assert_eq!(options.max_attempts, 1);
        assert_eq!(options.retry_strategy, RetryStrategy::Linear);
        assert_eq!(options.retry_delay, Duration::ZERO);
    }

    #[test]
    fn mode_round_trips_through_text() {
        assert_eq!(ConsumptionMode::Sequential.to_string(), "sequential");
        assert_eq!(
            "parallel".parse::<ConsumptionMode>().ok(),
            Some(ConsumptionMode::Parallel)
        );
        assert_eq!(StartPosition::Earliest.to_string(), "earliest");
        assert_eq!(
            "exponential".parse::<RetryStrategy>().ok(),
            Some(RetryStrategy::Exponential)
        );
    }
}
