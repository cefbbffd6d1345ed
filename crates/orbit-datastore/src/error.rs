use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("failed to open datastore at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },

    #[error("datastore is not connected")]
    NotConnected,

    #[error("schema migration {version} failed: {reason}")]
    SchemaFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: String, reason: String },

    #[error("task queue is shut down")]
    QueueClosed,

    #[error("failed to spawn worker thread {name}: {reason}")]
    WorkerSpawn { name: String, reason: String },

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for DatastoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::QueryFailed(error.to_string())
    }
}

impl From<config::ConfigError> for DatastoreError {
    fn from(error: config::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DatastoreError>;
