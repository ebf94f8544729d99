//! User-facing notifications.
//!
//! Components report failures here instead of returning them to a caller that
//! may no longer exist (a finished background task, a closed conversation).
//! Every notification is also logged.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub detail: String,
}

#[derive(Clone)]
pub struct Notifications {
    tx: Option<mpsc::UnboundedSender<Notification>>,
}

impl Notifications {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Log-only sink.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn error(&self, title: &str, detail: impl std::fmt::Display) {
        let detail = detail.to_string();
        log::warn!("{title}: {detail}");
        self.push(Severity::Error, title, detail);
    }

    pub fn info(&self, title: &str, detail: impl std::fmt::Display) {
        let detail = detail.to_string();
        log::info!("{title}: {detail}");
        self.push(Severity::Info, title, detail);
    }

    fn push(&self, severity: Severity, title: &str, detail: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Notification {
                severity,
                title: title.to_string(),
                detail,
            });
        }
    }
}
