use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    broker::Broker,
    error::{Error, Result},
    message::{self, Message, SendOptions},
    scheduler::{self, ScheduleOptions, ScheduledMessage},
    subscription::{SubscribeOptions, Subscription},
    trim,
};

/// Topic settings, applied on first creation only.
#[derive(Debug, Clone)]
pub struct TopicOptions {
    /// Acknowledged messages to keep per topic; `None` keeps everything.
    pub max_retention: Option<i64>,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            max_retention: Some(0),
        }
    }
}

impl TopicOptions {
    pub fn max_retention(mut self, max_retention: i64) -> Self {
        self.max_retention = Some(max_retention);

        self
    }

    pub fn unlimited_retention(mut self) -> Self {
        self.max_retention = None;

        self
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TopicRow {
    id: Uuid,
    name: String,
    max_retention: Option<i64>,
}

const INSERT_TOPIC: &str = r#"
    INSERT INTO pgbus_topics (id, name, max_retention)
    VALUES ($1, $2, $3)
    ON CONFLICT (name) DO NOTHING;
"#;

const SELECT_TOPIC: &str = r#"
    SELECT id, name, max_retention FROM pgbus_topics WHERE name = $1;
"#;

const SELECT_TOPIC_MESSAGES: &str = r#"
    SELECT id, topic_id, payload, deliver_at, priority, created_at
    FROM pgbus_messages
    WHERE topic_id = $1
    ORDER BY id ASC;
"#;

const CLEAR_TOPIC_MESSAGES: &str = r#"
    DELETE FROM pgbus_messages WHERE topic_id = $1;
"#;

const DELETE_TOPIC: &str = r#"
    DELETE FROM pgbus_topics WHERE id = $1;
"#;

const UPSERT_SCHEDULE: &str = r#"
    INSERT INTO pgbus_scheduled_messages
        (id, topic_id, name, payload, cron, next_occurrence_at, deliver_in_ms, deliver_at, priority, repeats)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (topic_id, name) DO UPDATE SET
        payload = EXCLUDED.payload,
        cron = EXCLUDED.cron,
        next_occurrence_at = EXCLUDED.next_occurrence_at,
        deliver_in_ms = EXCLUDED.deliver_in_ms,
        deliver_at = EXCLUDED.deliver_at,
        priority = EXCLUDED.priority,
        repeats = EXCLUDED.repeats
    RETURNING id, topic_id, name, payload, cron, next_occurrence_at, deliver_in_ms,
              deliver_at, priority, repeats, repeats_made, created_at;
"#;

const SELECT_SCHEDULES: &str = r#"
    SELECT id, topic_id, name, payload, cron, next_occurrence_at, deliver_in_ms,
           deliver_at, priority, repeats, repeats_made, created_at
    FROM pgbus_scheduled_messages
    WHERE topic_id = $1
    ORDER BY name ASC;
"#;

/// A named message stream. Created lazily on first reference; immutable after
/// creation.
#[derive(Clone)]
pub struct Topic {
    pub(crate) broker: Broker,
    pub id: Uuid,
    pub name: String,
    pub max_retention: Option<i64>,
}

impl Topic {
    pub(crate) async fn create(broker: Broker, name: &str, options: TopicOptions) -> Result<Self> {
        sqlx::query(INSERT_TOPIC)
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(options.max_retention)
            .execute(broker.pool())
            .await?;

        let row: TopicRow = sqlx::query_as(SELECT_TOPIC)
            .bind(name)
            .fetch_one(broker.pool())
            .await?;

        Ok(Self {
            broker,
            id: row.id,
            name: row.name,
            max_retention: row.max_retention,
        })
    }

    /// Sends a single message.
    pub async fn send<P: Serialize>(&self, payload: P, options: SendOptions) -> Result<Message> {
        let mut messages = self
            .send_values(vec![serde_json::to_value(payload)?], options)
            .await?;

        match messages.pop() {
            Some(message) => Ok(message),
            None => Err(Error::Sqlx(sqlx::Error::RowNotFound)),
        }
    }

    /// Sends a batch of messages in one transaction.
    ///
    /// Ids are generated monotonically in array order, so the batch's
    /// insertion order is its delivery order within each priority class. The
    /// fan-out to subscription state rows commits atomically with the
    /// messages.
    pub async fn send_bulk<P: Serialize>(
        &self,
        payloads: Vec<P>,
        options: SendOptions,
    ) -> Result<Vec<Message>> {
        let payloads = payloads
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.send_values(payloads, options).await
    }

    async fn send_values(
        &self,
        payloads: Vec<serde_json::Value>,
        options: SendOptions,
    ) -> Result<Vec<Message>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let deliver_at = options.resolve_deliver_at(now);

        let messages: Vec<Message> = payloads
            .into_iter()
            .map(|payload| Message {
                id: self.broker.next_id(),
                topic_id: self.id,
                payload,
                deliver_at,
                priority: options.priority,
                created_at: now,
            })
            .collect();

        let message_ids: Vec<String> = messages.iter().map(|m| m.id.to_owned()).collect();

        let mut tx = self.broker.pool().begin().await?;
        message::insert_messages(&mut tx, &messages).await?;
        message::fan_out(&mut tx, self.id, &message_ids, deliver_at).await?;
        tx.commit().await?;

        tracing::debug!(topic = %self.name, count = messages.len(), "sent messages");

        Ok(messages)
    }

    /// Creates or updates a named cron schedule for this topic.
    ///
    /// The expression is validated here; invalid cron surfaces synchronously.
    /// Upserting an existing name replaces the schedule but keeps its
    /// `repeats_made` counter.
    pub async fn schedule<P: Serialize>(
        &self,
        name: &str,
        schedule: ScheduleOptions,
        payload: P,
        options: SendOptions,
    ) -> Result<ScheduledMessage> {
        let parsed = scheduler::parse_cron(&schedule.cron)?;
        let next_occurrence_at = scheduler::next_occurrence(&parsed, &Utc::now());

        if next_occurrence_at.is_none() {
            return Err(Error::CronExhausted {
                expression: schedule.cron,
            });
        }

        let row: ScheduledMessage = sqlx::query_as(UPSERT_SCHEDULE)
            .bind(Uuid::new_v4())
            .bind(self.id)
            .bind(name)
            .bind(serde_json::to_value(payload)?)
            .bind(&schedule.cron)
            .bind(next_occurrence_at)
            .bind(options.deliver_in.map(|d| d.as_millis() as i64))
            .bind(options.deliver_at)
            .bind(options.priority)
            .bind(schedule.repeats)
            .fetch_one(self.broker.pool())
            .await?;

        Ok(row)
    }

    /// Creates the subscription on first call; later calls return the stored
    /// one (stored configuration wins on divergence).
    pub async fn subscribe(&self, name: &str) -> Result<Subscription> {
        self.subscribe_with(name, SubscribeOptions::default()).await
    }

    pub async fn subscribe_with(
        &self,
        name: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        Subscription::create(self.broker.clone(), self.id, name, options).await
    }

    /// All messages currently stored in the topic, earliest first.
    pub async fn messages(&self) -> Result<Vec<Message>> {
        Ok(sqlx::query_as(SELECT_TOPIC_MESSAGES)
            .bind(self.id)
            .fetch_all(self.broker.pool())
            .await?)
    }

    /// All cron schedules of the topic.
    pub async fn scheduled_messages(&self) -> Result<Vec<ScheduledMessage>> {
        Ok(sqlx::query_as(SELECT_SCHEDULES)
            .bind(self.id)
            .fetch_all(self.broker.pool())
            .await?)
    }

    /// Deletes every message in the topic, cascading to subscription state.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query(CLEAR_TOPIC_MESSAGES)
            .bind(self.id)
            .execute(self.broker.pool())
            .await?;

        Ok(())
    }

    /// Applies the retention policy now. Returns the number of trimmed
    /// messages.
    pub async fn trim(&self) -> Result<u64> {
        trim::trim_topic(self.broker.pool(), self.id, self.max_retention).await
    }

    /// Destroys the topic and, by cascade, its messages, schedules, and
    /// subscriptions.
    pub async fn remove(&self) -> Result<()> {
        sqlx::query(DELETE_TOPIC)
            .bind(self.id)
            .execute(self.broker.pool())
            .await?;

        Ok(())
    }
}
