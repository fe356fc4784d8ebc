use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, Transaction};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    consumer::ConsumerEvent,
    error::Result,
    subscription::{retry_delay, ConsumptionMode, Subscription, CLEAR_PROCESSING},
};

/// Delivery lifecycle of a message within one subscription.
///
/// The enum values are part of the persisted contract: they are stored in the
/// `pgbus_message_status` Postgres enum and used verbatim when filtering with
/// [`Subscription::messages`](crate::Subscription::messages).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, FromStr, Serialize, Deserialize, sqlx::Type,
)]
#[display(style = "lowercase")]
#[sqlx(type_name = "pgbus_message_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
}

/// A message stored in a topic.
///
/// The 26-char ULID `id` is the canonical total order within a topic: an
/// earlier id means the message was sent earlier. Payloads are arbitrary JSON
/// and immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub topic_id: Uuid,
    pub payload: Value,
    pub deliver_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Deserializes the JSON payload into a typed value.
    pub fn data<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Per-subscription delivery state of one message, joined with its payload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionMessage {
    pub subscription_id: Uuid,
    pub message_id: String,
    pub status: MessageStatus,
    pub attempts: i32,
    pub available_at: Option<DateTime<Utc>>,
    pub error_stack: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub progress: Option<Value>,
    pub stale_count: i32,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
    pub priority: Option<i32>,
}

/// Delivery options for [`Topic::send`](crate::Topic::send) and friends.
///
/// `deliver_at` wins over `deliver_in` when both are set. `priority` reorders
/// reservation (lower number first, unset sorts last) but never insertion.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub deliver_at: Option<DateTime<Utc>>,
    pub deliver_in: Option<std::time::Duration>,
    pub priority: Option<i32>,
}

impl SendOptions {
    pub fn deliver_at(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_at = Some(at);

        self
    }

    pub fn deliver_in(mut self, delay: std::time::Duration) -> Self {
        self.deliver_in = Some(delay);

        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);

        self
    }

    pub(crate) fn resolve_deliver_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.deliver_at.or_else(|| {
            self.deliver_in
                .map(|delay| now + chrono::Duration::milliseconds(delay.as_millis() as i64))
        })
    }
}

pub(crate) async fn insert_messages(
    tx: &mut Transaction<'_, Postgres>,
    messages: &[Message],
) -> Result<()> {
    for chunk in messages.chunks(100) {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO pgbus_messages (id, topic_id, payload, deliver_at, priority, created_at) ",
        );

        query_builder.push_values(chunk, |mut b, message| {
            b.push_bind(message.id.to_owned())
                .push_bind(message.topic_id)
                .push_bind(message.payload.clone())
                .push_bind(message.deliver_at)
                .push_bind(message.priority)
                .push_bind(message.created_at);
        });

        query_builder.build().execute(&mut **tx).await?;
    }

    Ok(())
}

const FAN_OUT: &str = r#"
    INSERT INTO pgbus_subscription_messages
        (subscription_id, message_id, status, attempts, available_at, stale_count)
    SELECT s.id, m.id, 'waiting'::pgbus_message_status, 0, $3, 0
    FROM pgbus_subscriptions s
    CROSS JOIN unnest($2::varchar[]) AS m (id)
    WHERE s.topic_id = $1
    ON CONFLICT DO NOTHING;
"#;

/// Inserts one state row per (new message, current subscription of the topic).
///
/// Runs inside the writer's transaction so a consumer can never observe a
/// message that is visible to some of the topic's subscriptions but not
/// others.
pub(crate) async fn fan_out(
    tx: &mut Transaction<'_, Postgres>,
    topic_id: Uuid,
    message_ids: &[String],
    available_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(FAN_OUT)
        .bind(topic_id)
        .bind(message_ids)
        .bind(available_at)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

const COMPLETE_MESSAGE: &str = r#"
    UPDATE pgbus_subscription_messages
    SET status = 'completed'
    WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing';
"#;

const RELEASE_MESSAGE: &str = r#"
    UPDATE pgbus_subscription_messages
    SET status = 'waiting', available_at = $3, error_stack = $4
    WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing';
"#;

const FAIL_MESSAGE: &str = r#"
    UPDATE pgbus_subscription_messages
    SET status = 'failed', available_at = NULL, error_stack = $3
    WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing';
"#;

const UPDATE_PROGRESS: &str = r#"
    UPDATE pgbus_subscription_messages
    SET progress = $3
    WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing';
"#;

const HEARTBEAT: &str = r#"
    UPDATE pgbus_subscription_messages
    SET last_heartbeat_at = now()
    WHERE subscription_id = $1 AND message_id = $2 AND status = 'processing';
"#;

/// A message reserved by a subscription, as handed to a handler.
///
/// Dropping a delivery without calling [`complete`](Delivery::complete) or
/// [`fail`](Delivery::fail) leaves the row in `processing`; the stale detector
/// reopens it once its heartbeat lapses.
#[derive(Clone)]
pub struct Delivery {
    pub(crate) subscription: Subscription,
    pub(crate) events: Option<broadcast::Sender<ConsumerEvent>>,
    pub message_id: String,
    pub payload: Value,
    pub priority: Option<i32>,
    pub attempts: i32,
    pub stale_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// Deserializes the JSON payload into a typed value.
    pub fn data<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// The subscription this delivery was reserved for.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Acknowledges the message for this subscription.
    ///
    /// In sequential mode the subscription gate is released in the same
    /// transaction. Completing an already-finalized delivery is a no-op, so
    /// at-least-once redelivery stays idempotent.
    pub async fn complete(&self) -> Result<()> {
        let mut tx = self.subscription.broker.pool().begin().await?;

        let result = sqlx::query(COMPLETE_MESSAGE)
            .bind(self.subscription.id)
            .bind(&self.message_id)
            .execute(&mut *tx)
            .await?;

        // The gate is released only when this call actually concluded the
        // message; a redundant complete must not unlock a sibling in flight.
        if result.rows_affected() > 0 && self.subscription.mode == ConsumptionMode::Sequential {
            sqlx::query(CLEAR_PROCESSING)
                .bind(self.subscription.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Records a handler failure.
    ///
    /// While `attempts < max_attempts` the row returns to `waiting` with
    /// `available_at` pushed out by the subscription's retry strategy;
    /// otherwise it becomes terminally `failed`. Either way the sequential
    /// gate is released in the same transaction.
    pub async fn fail(&self, error: impl std::fmt::Display) -> Result<()> {
        let error_stack = error.to_string();
        let mut tx = self.subscription.broker.pool().begin().await?;

        let result = if self.attempts >= self.subscription.max_attempts {
            sqlx::query(FAIL_MESSAGE)
                .bind(self.subscription.id)
                .bind(&self.message_id)
                .bind(&error_stack)
                .execute(&mut *tx)
                .await?
        } else {
            let delay = retry_delay(
                self.subscription.retry_strategy,
                self.subscription.retry_delay,
                self.attempts,
            );
            let available_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

            sqlx::query(RELEASE_MESSAGE)
                .bind(self.subscription.id)
                .bind(&self.message_id)
                .bind(available_at)
                .bind(&error_stack)
                .execute(&mut *tx)
                .await?
        };

        if result.rows_affected() > 0 && self.subscription.mode == ConsumptionMode::Sequential {
            sqlx::query(CLEAR_PROCESSING)
                .bind(self.subscription.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Writes handler progress and notifies consumer listeners.
    ///
    /// Progress is reset on every reservation, so each attempt starts clean.
    pub async fn update_progress<P: Serialize>(&self, progress: P) -> Result<()> {
        let progress = serde_json::to_value(progress)?;

        sqlx::query(UPDATE_PROGRESS)
            .bind(self.subscription.id)
            .bind(&self.message_id)
            .bind(&progress)
            .execute(self.subscription.broker.pool())
            .await?;

        if let Some(events) = &self.events {
            let _ = events.send(ConsumerEvent::Progress {
                message_id: self.message_id.to_owned(),
                progress,
            });
        }

        Ok(())
    }

    /// Refreshes `last_heartbeat_at` so the stale detector keeps its hands off.
    pub async fn heartbeat(&self) -> Result<()> {
        sqlx::query(HEARTBEAT)
            .bind(self.subscription.id)
            .bind(&self.message_id)
            .execute(self.subscription.broker.pool())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for (status, text) in [
            (MessageStatus::Waiting, "waiting"),
            (MessageStatus::Processing, "processing"),
            (MessageStatus::Completed, "completed"),
            (MessageStatus::Failed, "failed"),
        ] {
            assert_eq!(status.to_string(), text);
            assert_eq!(text.parse::<MessageStatus>().ok(), Some(status));
        }
    }

    #[test]
    fn deliver_at_wins_over_deliver_in() {
        let now = Utc::now();
        let at = now + chrono::Duration::hours(1);

        let options = SendOptions::default()
            .deliver_at(at)
            .deliver_in(std::time::Duration::from_secs(5));

        assert_eq!(options.resolve_deliver_at(now), Some(at));
    }

    #[test]
    fn deliver_in_maps_to_absolute_timestamp() {
        let now = Utc::now();
        let options = SendOptions::default().deliver_in(std::time::Duration::from_millis(2500));

        assert_eq!(
            options.resolve_deliver_at(now),
            Some(now + chrono::Duration::milliseconds(2500))
        );
    }

    #[test]
    fn immediate_delivery_has_no_timestamp() {
        assert_eq!(SendOptions::default().resolve_deliver_at(Utc::now()), None);
    }
}
