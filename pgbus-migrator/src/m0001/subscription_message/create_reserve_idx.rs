pub struct Operation;

// Partial index on waiting rows only: the reservation query filters on
// exactly this predicate and the table is dominated by completed rows.
const UP: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pgbus_subscription_messages_reserve
ON pgbus_subscription_messages (subscription_id, available_at)
WHERE status = 'waiting';
"#;

const DOWN: &str = "DROP INDEX idx_pgbus_subscription_messages_reserve;";

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
