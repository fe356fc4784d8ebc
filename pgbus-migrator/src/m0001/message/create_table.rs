pub struct Operation;

const UP: &str = r#"
CREATE TABLE IF NOT EXISTS pgbus_messages (
    id VARCHAR(26) PRIMARY KEY,
    topic_id UUID NOT NULL REFERENCES pgbus_topics (id) ON DELETE CASCADE,
    payload JSONB NOT NULL,
    deliver_at TIMESTAMPTZ,
    priority INTEGER,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

const DOWN: &str = "DROP TABLE pgbus_messages;";

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
