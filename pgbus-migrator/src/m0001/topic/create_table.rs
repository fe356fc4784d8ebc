pub struct Operation;

const UP: &str = r#"
CREATE TABLE IF NOT EXISTS pgbus_topics (
    id UUID PRIMARY KEY,
    name VARCHAR(255) UNIQUE NOT NULL,
    max_retention BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

const DOWN: &str = "DROP TABLE pgbus_topics;";

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
