use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{error::Result, message::MessageStatus};

/// Emitted when the stale detector reopens a crashed-consumer message.
#[derive(Debug, Clone)]
pub struct StaleEvent {
    pub subscription_id: Uuid,
    pub message_id: String,
}

// First lapse reopens the row, second one fails it: a message gets exactly one
// second chance after a consumer crash.
const RESET_STALE: &str = r#"
    UPDATE pgbus_subscription_messages
    SET status = CASE WHEN stale_count = 0
            THEN 'waiting'::pgbus_message_status
            ELSE 'failed'::pgbus_message_status
        END,
        stale_count = stale_count + 1,
        last_heartbeat_at = NULL
    WHERE status = 'processing'
      AND last_heartbeat_at <= now() - make_interval(secs => $1::double precision)
    RETURNING subscription_id, message_id, status;
"#;

const CLEAR_GATES: &str = r#"
    UPDATE pgbus_subscriptions SET processing = FALSE WHERE id = ANY($1);
"#;

/// Reopens or fails every `processing` row whose heartbeat has lapsed.
///
/// Runs in one transaction. Clearing the gate here is the recovery path for a
/// sequential consumer that crashed while holding it: the crash released the
/// row lock, but only this sweep can reset the advertised boolean.
pub(crate) async fn reset_stale(
    pool: &PgPool,
    stale_timeout: Duration,
    events: &broadcast::Sender<StaleEvent>,
) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let rows: Vec<(Uuid, String, MessageStatus)> = sqlx::query_as(RESET_STALE)
        .bind(stale_timeout.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

    if rows.is_empty() {
        return Ok(0);
    }

    let subscription_ids: Vec<Uuid> = rows.iter().map(|(id, _, _)| *id).collect();

    sqlx::query(CLEAR_GATES)
        .bind(&subscription_ids)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let affected = rows.len() as u64;

    for (subscription_id, message_id, status) in rows {
        tracing::debug!(%subscription_id, %message_id, ?status, "stale message swept");

        if status == MessageStatus::Waiting {
            let _ = events.send(StaleEvent {
                subscription_id,
                message_id,
            });
        }
    }

    Ok(affected)
}
