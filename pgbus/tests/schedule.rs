use chrono::{Duration, TimeZone, Utc};
use pgbus::{Broker, ScheduleOptions, ScheduledMessage, SendOptions};

mod common;

async fn backdate(
    broker: &Broker,
    schedule: &ScheduledMessage,
    to: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE pgbus_scheduled_messages SET next_occurrence_at = $1 WHERE id = $2")
        .bind(to)
        .bind(schedule.id)
        .execute(broker.pool())
        .await?;

    Ok(())
}

#[tokio::test]
async fn due_schedule_materializes_one_message() -> anyhow::Result<()> {
    let broker = common::create_broker("schedule_fires").await?;
    let topic = broker.topic("reports").await?;
    let subscription = topic.subscribe("mailer").await?;

    let schedule = topic
        .schedule(
            "my-job",
            ScheduleOptions::cron("0 0 * * *"),
            serde_json::json!({"report": "daily"}),
            SendOptions::default(),
        )
        .await?;

    assert_eq!(schedule.repeats_made, 0);
    assert!(schedule.next_occurrence_at.unwrap() > Utc::now());

    // Nothing due yet.
    assert_eq!(broker.process_scheduled().await?, 0);
    assert!(topic.messages().await?.is_empty());

    // Move the clock instead of waiting for midnight.
    let midnight = Utc
        .with_ymd_and_hms(2024, 3, 10, 0, 0, 0)
        .unwrap();
    backdate(&broker, &schedule, midnight).await?;

    assert_eq!(broker.process_scheduled().await?, 1);

    let messages = topic.messages().await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, serde_json::json!({"report": "daily"}));
    assert_eq!(subscription.pending_count().await?, 1);

    let schedules = topic.scheduled_messages().await?;
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].repeats_made, 1);
    // The next occurrence advances relative to the previous one, not to now.
    assert_eq!(
        schedules[0].next_occurrence_at,
        Some(midnight + Duration::days(1))
    );

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn repeats_cap_the_number_of_emissions() -> anyhow::Result<()> {
    let broker = common::create_broker("schedule_repeats").await?;
    let topic = broker.topic("reports").await?;

    let schedule = topic
        .schedule(
            "limited",
            ScheduleOptions::cron("0 0 * * *").repeats(1),
            "payload",
            SendOptions::default(),
        )
        .await?;

    backdate(&broker, &schedule, Utc::now() - Duration::seconds(1)).await?;
    assert_eq!(broker.process_scheduled().await?, 1);

    let schedules = topic.scheduled_messages().await?;
    backdate(&broker, &schedules[0], Utc::now() - Duration::seconds(1)).await?;

    // repeats_made reached repeats, the row is no longer selected.
    assert_eq!(broker.process_scheduled().await?, 0);
    assert_eq!(topic.messages().await?.len(), 1);

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn upsert_keeps_the_emission_counter() -> anyhow::Result<()> {
    let broker = common::create_broker("schedule_upsert").await?;
    let topic = broker.topic("reports").await?;

    let schedule = topic
        .schedule(
            "rolling",
            ScheduleOptions::cron("0 0 * * *"),
            "v1",
            SendOptions::default(),
        )
        .await?;

    backdate(&broker, &schedule, Utc::now() - Duration::seconds(1)).await?;
    broker.process_scheduled().await?;

    let updated = topic
        .schedule(
            "rolling",
            ScheduleOptions::cron("*/5 * * * *"),
            "v2",
            SendOptions::default().priority(2),
        )
        .await?;

    assert_eq!(updated.id, schedule.id);
    assert_eq!(updated.repeats_made, 1, "upsert must not reset repeats_made");
    assert_eq!(updated.cron, "*/5 * * * *");
    assert_eq!(updated.payload, serde_json::json!("v2"));

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn invalid_cron_surfaces_synchronously() -> anyhow::Result<()> {
    let broker = common::create_broker("schedule_invalid").await?;
    let topic = broker.topic("reports").await?;

    let result = topic
        .schedule(
            "broken",
            ScheduleOptions::cron("every tuesday-ish"),
            "payload",
            SendOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(pgbus::Error::Cron { .. })));
    assert!(topic.scheduled_messages().await?.is_empty());

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn materialized_messages_inherit_schedule_options() -> anyhow::Result<()> {
    let broker = common::create_broker("schedule_inherit").await?;
    let topic = broker.topic("reports").await?;

    let schedule = topic
        .schedule(
            "prioritized",
            ScheduleOptions::cron("0 0 * * *"),
            "payload",
            SendOptions::default()
                .priority(3)
                .deliver_in(std::time::Duration::from_secs(3600)),
        )
        .await?;

    backdate(&broker, &schedule, Utc::now() - Duration::seconds(1)).await?;
    broker.process_scheduled().await?;

    let messages = topic.messages().await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].priority, Some(3));
    assert!(messages[0].deliver_at.unwrap() > Utc::now());

    broker.close().await?;

    Ok(())
}
