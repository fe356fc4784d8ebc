pub struct Operation;

const UP: &str = r#"
CREATE TABLE IF NOT EXISTS pgbus_subscription_messages (
    subscription_id UUID NOT NULL REFERENCES pgbus_subscriptions (id) ON DELETE CASCADE,
    message_id VARCHAR(26) NOT NULL REFERENCES pgbus_messages (id) ON DELETE CASCADE,
    status pgbus_message_status NOT NULL DEFAULT 'waiting',
    attempts INTEGER NOT NULL DEFAULT 0,
    available_at TIMESTAMPTZ,
    error_stack TEXT,
    last_heartbeat_at TIMESTAMPTZ,
    progress JSONB,
    stale_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (subscription_id, message_id)
);
"#;

const DOWN: &str = "DROP TABLE pgbus_subscription_messages;";

#[async_trait::async_trait]
impl sqlx_migrator::Operation<sqlx::Postgres> for Operation {
    async fn up(&self, connection: &mut sqlx::PgConnection) -> Result<(), sqlx_migrator::Error> {
        sqlx::query(UP).execute(connection).await?;

        Ok(())
    }

    async fn down(&self, connection: &mut sqlx::PgConnection) -> Result<(), sqlx_migrator::Error> {
        sqlx::query(DOWN).execute(connection).await?;

        Ok(())
    }
}
