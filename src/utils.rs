use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

pub static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime")
});

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Websocket base for the change feed when none is configured: same host as the
/// REST store, `ws(s)` scheme, `/feed` path.
pub fn feed_url_from_store(store_url: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(&normalize_url(store_url))?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot derive feed url from {store_url}")))?;
    let path = format!("{}/feed", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
