use thiserror::Error;

/// Startup failures while bringing up persistence.
#[derive(Error, Debug)]
pub enum Eov6Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
