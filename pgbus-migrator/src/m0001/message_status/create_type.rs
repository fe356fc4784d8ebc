pub struct Operation;

const UP: &str = r#"
CREATE TYPE pgbus_message_status AS ENUM (
    'waiting',
    'processing',
    'completed',
    'failed'
);
"#;

const DOWN: &str = "DROP TYPE pgbus_message_status;";

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
