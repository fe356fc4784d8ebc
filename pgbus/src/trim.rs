use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

// `earliest` is the smallest unacknowledged id across the topic's
// subscriptions (NULL when every row is completed or no subscription exists);
// `cutoff` is the (max_retention + 1)-th largest id strictly below it. One
// statement, so the horizon and the delete see the same snapshot.
const TRIM_TOPIC: &str = r#"
    WITH earliest AS (
        SELECT MIN(sm.message_id) AS id
        FROM pgbus_subscription_messages sm
        JOIN pgbus_subscriptions s ON s.id = sm.subscription_id
        WHERE s.topic_id = $1 AND sm.status <> 'completed'
    ),
    cutoff AS (
        SELECT m.id
        FROM pgbus_messages m
        WHERE m.topic_id = $1
          AND ((SELECT id FROM earliest) IS NULL OR m.id < (SELECT id FROM earliest))
        ORDER BY m.id DESC
        OFFSET $2
        LIMIT 1
    )
    DELETE FROM pgbus_messages
    WHERE topic_id = $1 AND id <= (SELECT id FROM cutoff);
"#;

/// Deletes acknowledged messages past the topic's retention cap.
///
/// Keeps at least `max_retention` acknowledged messages and never touches a
/// message some subscription has not completed. Cascade removes the
/// subscription-message rows. Returns the number of trimmed messages.
pub(crate) async fn trim_topic(
    pool: &PgPool,
    topic_id: Uuid,
    max_retention: Option<i64>,
) -> Result<u64> {
    let Some(max_retention) = max_retention else {
        return Ok(0);
    };

    let result = sqlx::query(TRIM_TOPIC)
        .bind(topic_id)
        .bind(max_retention)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
