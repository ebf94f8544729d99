use thiserror::Error;

/// Every failure the engine can report.
///
/// `Transport` and `Device` failures are turned into a user notification at the
/// component boundary. `Validation` stops an operation before any I/O happens.
/// `StaleResult` marks a superseded async result and is never shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("stale result discarded")]
    StaleResult,
    #[error("cache error: {0}")]
    Cache(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }

    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Error::StaleResult)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Error::Transport(format!("HTTP {status}"))
        } else {
            Error::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Transport(format!("malformed response: {e}"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Cache(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("invalid url: {e}"))
    }
}
