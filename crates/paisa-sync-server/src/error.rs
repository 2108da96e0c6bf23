use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Unknown sync table: {0}")]
    UnknownTable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
