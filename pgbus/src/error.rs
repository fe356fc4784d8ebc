#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("migration `{0}`")]
    Migration(#[from] sqlx_migrator::Error),

    #[error("invalid cron expression `{expression}`: {source}")]
    Cron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("cron expression `{expression}` has no future occurrence")]
    CronExhausted { expression: String },

    #[error("broker is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
