pub struct Operation;

const UP: &str = r#"
CREATE TABLE IF NOT EXISTS pgbus_subscriptions (
    id UUID PRIMARY KEY,
    topic_id UUID NOT NULL REFERENCES pgbus_topics (id) ON DELETE CASCADE,
    name VARCHAR(255) NOT NULL,
    consumption_mode VARCHAR(16) NOT NULL,
    start_position VARCHAR(16) NOT NULL,
    max_attempts INTEGER NOT NULL,
    retry_strategy VARCHAR(16) NOT NULL,
    retry_delay_ms BIGINT NOT NULL,
    processing BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (topic_id, name)
);
"#;

const DOWN: &str = "DROP TABLE pgbus_subscriptions;";

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
