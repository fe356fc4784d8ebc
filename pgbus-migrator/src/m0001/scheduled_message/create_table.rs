pub struct Operation;

const UP: &str = r#"
CREATE TABLE IF NOT EXISTS pgbus_scheduled_messages (
    id UUID PRIMARY KEY,
    topic_id UUID NOT NULL REFERENCES pgbus_topics (id) ON DELETE CASCADE,
    name VARCHAR(255) NOT NULL,
    payload JSONB NOT NULL,
    cron VARCHAR(255) NOT NULL,
    next_occurrence_at TIMESTAMPTZ,
    deliver_in_ms BIGINT,
    deliver_at TIMESTAMPTZ,
    priority INTEGER,
    repeats INTEGER,
    repeats_made INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (topic_id, name)
);
"#;

const DOWN: &str = "DROP TABLE pgbus_scheduled_messages;";

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
