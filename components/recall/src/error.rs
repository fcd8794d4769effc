/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub(crate) const REDACTED: &str = "[REDACTED]";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid lore: {0}")]
    InvalidLore(#[from] InvalidLore),

    #[error("Invalid store id {id:?}: {reason}")]
    InvalidStoreId { id: String, reason: &'static str },

    #[error("Unknown merge strategy {0:?} (expected skip, replace or merge)")]
    InvalidMergeStrategy(String),

    #[error("No lore entry with id {0:?}")]
    NotFound(String),

    #[error("No store named {0:?}")]
    StoreNotFound(String),

    #[error("Reference {reference:?} matches {count} entries; use the full id")]
    AmbiguousRef { reference: String, count: usize },

    #[error("Store {0:?} already exists")]
    StoreExists(String),

    #[error("Deleting store {0:?} requires confirmation")]
    DeleteNotConfirmed(String),

    #[error("No Engram URL configured; set ENGRAM_URL or pass --engram-url")]
    Offline,

    #[error("Engram rejected the request to {endpoint}: unauthorized")]
    Unauthorized { endpoint: String },

    #[error("Engram request to {endpoint} failed with status {status}: {message}")]
    Remote {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Transient Engram error: {0}")]
    Transient(String),

    #[error("{0}")]
    Cancelled(#[from] interrupt_support::Interrupted),

    #[error("The store is closed")]
    StoreClosed,

    #[error("Snapshot is corrupt or incompatible: {0}")]
    Corrupt(String),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Error parsing URL: {0}")]
    UrlParseError(#[from] url::ParseError),
}

/// Why a lore entry failed validation. Raised before anything is written.
#[derive(Debug, thiserror::Error)]
pub enum InvalidLore {
    #[error("Content is empty")]
    EmptyContent,

    #[error("Content is {0} bytes; the limit is {max}", max = crate::types::MAX_CONTENT_LEN)]
    ContentTooLong(usize),

    #[error("Context is {0} bytes; the limit is {max}", max = crate::types::MAX_CONTEXT_LEN)]
    ContextTooLong(usize),

    #[error("Unknown category {0:?}")]
    InvalidCategory(String),

    #[error("Confidence {0} is outside 0.0..=1.0")]
    InvalidConfidence(f64),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors the sync engine may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// A short label identifying the error type, free of any
    /// potentially-sensitive detail.
    pub fn label(&self) -> &'static str {
        match self {
            Error::InvalidLore(_) => "InvalidLore",
            Error::InvalidStoreId { .. } => "InvalidStoreId",
            Error::InvalidMergeStrategy(_) => "InvalidMergeStrategy",
            Error::NotFound(_) => "NotFound",
            Error::StoreNotFound(_) => "StoreNotFound",
            Error::AmbiguousRef { .. } => "AmbiguousRef",
            Error::StoreExists(_) => "StoreExists",
            Error::DeleteNotConfirmed(_) => "DeleteNotConfirmed",
            Error::Offline => "Offline",
            Error::Unauthorized { .. } => "Unauthorized",
            Error::Remote { .. } => "Remote",
            Error::Transient(_) => "Transient",
            Error::Cancelled(_) => "Cancelled",
            Error::StoreClosed => "StoreClosed",
            Error::Corrupt(_) => "Corrupt",
            Error::SqlError(_) => "SqlError",
            Error::OpenDatabaseError(_) => "OpenDatabaseError",
            Error::JsonError(_) => "JsonError",
            Error::IoError(_) => "IoError",
            Error::UrlParseError(_) => "UrlParseError",
        }
    }
}

/// Replace every occurrence of the configured API key in `text` with
/// `[REDACTED]`. Applied to remote error bodies and transport errors before
/// the message is stored on an error value, so the key can never reach a log
/// line or the terminal.
pub fn redact_api_key(text: &str, api_key: Option<&str>) -> String {
    match api_key {
        Some(key) if !key.is_empty() => text.replace(key, REDACTED),
        _ => text.to_string(),
    }
}
