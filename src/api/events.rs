use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Websocket frame pushed by the change feed, `{ "type", "payload" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum FeedFrame<T> {
    /// Full current state of the subscribed collection.
    Snapshot(Vec<T>),
    /// Out-of-band failure reported by the store.
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Transport(format!("{}: {}", e.code, e.message))
    }
}
