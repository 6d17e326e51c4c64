use std::{fmt, io};

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::Error as SqlxError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum TallyError {
    #[error("Cache/Database error: {0}")]
    Cache(String),
    #[error("Counter configuration error: {0}")]
    Config(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for TallyError {
    fn from(src: toml::de::Error) -> TallyError {
        TallyError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for TallyError {
    fn from(src: toml::ser::Error) -> TallyError {
        TallyError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for TallyError {
    fn from(src: JsonError) -> TallyError {
        TallyError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for TallyError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => TallyError::NotFound(format!("{x}")),
            _ => TallyError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for TallyError {
    fn from(x: fmt::Error) -> Self {
        TallyError::Serialization(format!("{x}"))
    }
}

impl From<SqlxError> for TallyError {
    fn from(db_error: SqlxError) -> Self {
        TallyError::Cache(format!("database error: {db_error:?}"))
    }
}
