use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::api::events::FeedFrame;
use crate::api::models::{ConversationRecord, MessageId, MessageRecord, UserProfile};
use crate::api::{BlobStore, RemoteStore};
use crate::app::AppConfig;
use crate::error::{Error, Result};
use crate::feed::{self, FeedSender, Subscription};
use crate::session::Session;
use crate::utils::{format_timestamp, normalize_url};

/// REST + websocket client for the remote store and the audio upload endpoint.
#[derive(Clone)]
pub struct ApiClient {
    http: HttpClient,
    store_url: String,
    feed_url: Url,
    upload_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    user: UserProfile,
}

impl ApiClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            store_url: normalize_url(&config.store_url),
            feed_url: config.resolved_feed_url()?,
            upload_url: normalize_url(&config.upload_url),
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.store_url.trim_end_matches('/'), path)
    }

    /// `<store>/<collection>/<id>` with the id escaped as one path segment.
    fn resource(&self, collection: &str, id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint(collection))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("store url {} cannot take a path", self.store_url)))?
            .push(id);
        Ok(url)
    }

    fn with_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = self.with_auth(req).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Transport(format!("HTTP {}", resp.status())));
        }
        Ok(resp)
    }

    /// Exchange credentials for a session. The bearer token is kept for later calls.
    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<Session> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(Error::validation("email and password are required"));
        }
        let body = serde_json::json!({ "email": email.trim(), "password": password });
        let resp = self.send(self.http.post(self.endpoint("auth/login")).json(&body)).await?;
        let login: LoginResponse = serde_json::from_slice(&resp.bytes().await?)?;
        log::info!("signed in as {}", login.user.uid);
        self.token = Some(login.token.clone());
        Ok(Session::new(login.user, Some(login.token)))
    }

    pub async fn sign_out(&mut self) -> Result<()> {
        let result = self.send(self.http.post(self.endpoint("auth/logout"))).await;
        self.token = None;
        result.map(|_| ())
    }

    fn feed_endpoint(&self, collection: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.feed_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("feed url {} cannot take a path", self.feed_url)))?
            .pop_if_empty()
            .push(collection);
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in params {
                query.append_pair(k, v);
            }
            if let Some(t) = &self.token {
                query.append_pair("token", t);
            }
        }
        Ok(url)
    }

    fn subscribe<R>(&self, collection: &str, params: &[(&str, &str)]) -> Subscription<Vec<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let (tx, sub) = feed::channel();
        match self.feed_endpoint(collection, params) {
            Ok(url) => {
                let task = tokio::spawn(run_feed(url, tx));
                sub.cancel_handle().bind_task(task.abort_handle());
            }
            Err(e) => {
                tx.error(e);
            }
        }
        sub
    }
}

async fn run_feed<R: DeserializeOwned + Send + 'static>(url: Url, tx: FeedSender<Vec<R>>) {
    log::debug!("opening change feed {}", url.path());
    let (mut ws, _) = match connect_async(url.as_str()).await {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("change feed connect failed: {e}");
            tx.error(e.into());
            return;
        }
    };
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => {
                let _ = ws.close(None).await;
                return;
            }
            frame = ws.next() => frame,
        };
        let delivered = match frame {
            Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<FeedFrame<R>>(&text) {
                Ok(FeedFrame::Snapshot(records)) => tx.snapshot(records),
                Ok(FeedFrame::Error(remote)) => tx.error(remote.into()),
                Err(e) => {
                    log::warn!("unreadable change feed frame: {e}");
                    tx.error(e.into())
                }
            },
            Some(Ok(WsMessage::Close(_))) | None => {
                tx.error(Error::transport("change feed closed"));
                return;
            }
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                tx.error(e.into());
                return;
            }
        };
        if !delivered {
            return;
        }
    }
}

/// Accepts a bare JSON array or one wrapped in `data`.
fn list_items(json: Value) -> Vec<Value> {
    match json {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl RemoteStore for ApiClient {
    fn subscribe_messages(&self, conversation_id: &str) -> Subscription<Vec<MessageRecord>> {
        self.subscribe("messages", &[("conversationId", conversation_id)])
    }

    fn subscribe_conversations(&self, user_id: &str) -> Subscription<Vec<ConversationRecord>> {
        self.subscribe("conversations", &[("participant", user_id)])
    }

    async fn append_message(&self, record: MessageRecord) -> Result<MessageId> {
        let resp = self.send(self.http.post(self.endpoint("messages")).json(&record)).await?;
        let json: Value = serde_json::from_slice(&resp.bytes().await?)?;
        json.get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::transport("malformed response: no message id"))
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "lastMessage": preview,
            "lastMessageTime": format_timestamp(at),
        });
        let url = self.resource("conversations", conversation_id)?;
        self.send(self.http.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn find_conversation(
        &self,
        user_id: &str,
        other_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        let req = self
            .http
            .get(self.endpoint("conversations"))
            .query(&[("participant", user_id)]);
        let resp = self.send(req).await?;
        let json: Value = serde_json::from_slice(&resp.bytes().await?)?;
        for item in list_items(json) {
            match serde_json::from_value::<ConversationRecord>(item) {
                Ok(rec) if rec.participants.contains(other_id) => return Ok(Some(rec)),
                Ok(_) => {}
                Err(e) => log::warn!("skipping unreadable conversation: {e}"),
            }
        }
        Ok(None)
    }

    async fn create_conversation(&self, record: ConversationRecord) -> Result<ConversationRecord> {
        let resp = self.send(self.http.post(self.endpoint("conversations")).json(&record)).await?;
        let json: Value = serde_json::from_slice(&resp.bytes().await?)?;
        if json.get("participants").is_some() {
            return Ok(serde_json::from_value(json)?);
        }
        let id = json
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(Error::transport("No conversation id in response"));
        }
        Ok(ConversationRecord {
            id: Some(id),
            ..record
        })
    }

    async fn get_user(&self, user_id: &str) -> Result<UserProfile> {
        let url = self.resource("users", user_id)?;
        let resp = self.send(self.http.get(url)).await?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserProfile>> {
        let req = self.http.get(self.endpoint("users")).query(&[("q", query)]);
        let resp = self.send(req).await?;
        let json: Value = serde_json::from_slice(&resp.bytes().await?)?;
        let mut out = Vec::new();
        for item in list_items(json) {
            match serde_json::from_value::<UserProfile>(item) {
                Ok(user) => out.push(user),
                Err(e) => log::warn!("skipping unreadable user: {e}"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl BlobStore for ApiClient {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let file_name = match content_type {
            "audio/wav" => "recording.wav",
            _ => "audio.webm",
        };
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(content_type)?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self.send(self.http.post(&self.upload_url).multipart(form)).await?;
        let json: Value = serde_json::from_slice(&resp.bytes().await?)?;
        json.get("secure_url")
            .or_else(|| json.get("url"))
            .and_then(|v| v.as_str())
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::transport("malformed response: no durable url"))
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let resp = self.send(self.http.get(reference)).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}
