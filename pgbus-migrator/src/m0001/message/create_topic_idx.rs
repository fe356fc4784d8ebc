pub struct Operation;

const UP: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pgbus_messages_topic_id
ON pgbus_messages (topic_id, id);
"#;

const DOWN: &str = "DROP INDEX idx_pgbus_messages_topic_id;";

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
