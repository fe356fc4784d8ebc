use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    broker::Broker,
    error::{Error, Result},
    message::{self, Message},
};

/// A cron-driven message template, unique per `(topic, name)`.
///
/// The scheduler sweep turns each due row into one concrete message and
/// advances `next_occurrence_at`; `repeats_made` counts emissions and survives
/// re-scheduling under the same name.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub name: String,
    pub payload: Value,
    pub cron: String,
    pub next_occurrence_at: Option<DateTime<Utc>>,
    pub deliver_in_ms: Option<i64>,
    pub deliver_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub repeats: Option<i32>,
    pub repeats_made: i32,
    pub created_at: DateTime<Utc>,
}

/// Recurrence settings for [`Topic::schedule`](crate::Topic::schedule).
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub cron: String,
    pub repeats: Option<i32>,
}

impl ScheduleOptions {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron: expression.into(),
            repeats: None,
        }
    }

    /// Caps the schedule at `repeats` emissions in total.
    pub fn repeats(mut self, repeats: i32) -> Self {
        self.repeats = Some(repeats);

        self
    }
}

/// Parses a cron expression, accepting the common 5-field form by prepending
/// a seconds field.
pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    };

    cron::Schedule::from_str(&normalized).map_err(|source| Error::Cron {
        expression: expression.to_owned(),
        source,
    })
}

pub(crate) fn next_occurrence(
    schedule: &cron::Schedule,
    after: &DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(after).next()
}

const SELECT_DUE: &str = r#"
    SELECT id, topic_id, name, payload, cron, next_occurrence_at, deliver_in_ms,
           deliver_at, priority, repeats, repeats_made, created_at
    FROM pgbus_scheduled_messages
    WHERE next_occurrence_at IS NOT NULL
      AND next_occurrence_at <= now()
      AND (repeats IS NULL OR repeats_made < repeats)
    ORDER BY next_occurrence_at ASC
    FOR UPDATE SKIP LOCKED;
"#;

const ADVANCE_SCHEDULE: &str = r#"
    UPDATE pgbus_scheduled_messages
    SET next_occurrence_at = $2, repeats_made = repeats_made + 1
    WHERE id = $1;
"#;

/// Materializes every due schedule into a concrete message.
///
/// One transaction for the whole sweep: due rows are taken with
/// `FOR UPDATE SKIP LOCKED` so concurrent processes split the work, and a
/// rollback leaves the rows due; firing is at-least-once per occurrence.
pub(crate) async fn process_scheduled_messages(broker: &Broker) -> Result<u64> {
    let mut tx = broker.pool().begin().await?;

    let due: Vec<ScheduledMessage> = sqlx::query_as(SELECT_DUE).fetch_all(&mut *tx).await?;

    let mut fired = 0;

    for schedule in due {
        let now = Utc::now();
        let deliver_at = schedule.deliver_at.or_else(|| {
            schedule
                .deliver_in_ms
                .map(|ms| now + chrono::Duration::milliseconds(ms))
        });

        let materialized = Message {
            id: broker.next_id(),
            topic_id: schedule.topic_id,
            payload: schedule.payload.clone(),
            deliver_at,
            priority: schedule.priority,
            created_at: now,
        };

        message::insert_messages(&mut tx, std::slice::from_ref(&materialized)).await?;
        message::fan_out(
            &mut tx,
            schedule.topic_id,
            std::slice::from_ref(&materialized.id),
            deliver_at,
        )
        .await?;

        let parsed = parse_cron(&schedule.cron)?;
        let next = schedule
            .next_occurrence_at
            .and_then(|previous| next_occurrence(&parsed, &previous));

        sqlx::query(ADVANCE_SCHEDULE)
            .bind(schedule.id)
            .bind(next)
            .execute(&mut *tx)
            .await?;

        tracing::debug!(
            schedule = %schedule.name,
            message_id = %materialized.id,
            next = ?next,
            "materialized scheduled message"
        );

        fired += 1;
    }

    tx.commit().await?;

    Ok(fired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_accepted() {
        assert!(parse_cron("0 0 * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert!(parse_cron("*/2 * * * * *").is_ok());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_cron("not a cron"),
            Err(Error::Cron { .. })
        ));
    }

    #[test]
    fn daily_schedule_advances_by_one_day() {
        let schedule = parse_cron("0 0 * * *").unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();

        assert_eq!(
            next_occurrence(&schedule, &midnight),
            Some(Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn next_occurrence_is_strictly_after_the_reference() {
        let schedule = parse_cron("* * * * *").unwrap();
        let reference = Utc.with_ymd_and_hms(2024, 3, 10, 12, 30, 0).unwrap();

        let next = next_occurrence(&schedule, &reference).unwrap();

        assert!(next > reference);
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2024, 3, 10, 12, 31, 0).unwrap()
        );
    }
}
