//! On-demand translation of a single message.
//!
//! Every request gets a ticket from the view model. The `Pending` overlay is
//! written before any I/O, and the terminal overlay is written only if no newer
//! request for the same message (and no conversation switch) happened meanwhile.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::api::BlobStore;
use crate::api::models::{Message, Payload};
use crate::app::{AppConfig, is_well_formed_language};
use crate::audio::LocalAudio;
use crate::error::{Error, Result};
use crate::notify::Notifications;
use crate::utils::normalize_url;
use crate::view_model::{MessageViewModelStore, RequestTicket, TranslationMode, TranslationOverlay};

/// Payload kind crossed with output kind, as the backend names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationOption {
    TextToText,
    SpeechToText,
    TextToSpeech,
    SpeechToSpeech,
}

impl TranslationOption {
    pub fn new(audio_input: bool, mode: TranslationMode) -> Self {
        match (audio_input, mode) {
            (false, TranslationMode::ToText) => Self::TextToText,
            (true, TranslationMode::ToText) => Self::SpeechToText,
            (false, TranslationMode::ToSpeech) => Self::TextToSpeech,
            (true, TranslationMode::ToSpeech) => Self::SpeechToSpeech,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextToText => "text-to-text",
            Self::SpeechToText => "speech-to-text",
            Self::TextToSpeech => "text-to-speech",
            Self::SpeechToSpeech => "speech-to-speech",
        }
    }

    pub fn yields_text(self) -> bool {
        matches!(self, Self::TextToText | Self::SpeechToText)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Text(String),
    Audio(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationRequest {
    pub option: TranslationOption,
    pub language: String,
    pub payload: RequestPayload,
}

impl TranslationRequest {
    /// The option always agrees with the payload kind.
    pub fn new(mode: TranslationMode, language: &str, payload: RequestPayload) -> Self {
        let audio_input = matches!(payload, RequestPayload::Audio(_));
        Self {
            option: TranslationOption::new(audio_input, mode),
            language: language.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationOutput {
    Text(String),
    Audio(Vec<u8>),
}

#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn translate(&self, request: TranslationRequest) -> Result<TranslationOutput>;
}

/// Form-post client for the translation service.
#[derive(Clone)]
pub struct HttpTranslator {
    http: HttpClient,
    url: String,
}

#[derive(Deserialize)]
struct TextResponse {
    translated_text: String,
}

impl HttpTranslator {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: normalize_url(&config.translate_url),
        })
    }
}

#[async_trait]
impl TranslationBackend for HttpTranslator {
    async fn translate(&self, request: TranslationRequest) -> Result<TranslationOutput> {
        let option = request.option;
        let form = Form::new()
            .text("option", option.as_str())
            .text("language", request.language);
        let form = match request.payload {
            RequestPayload::Text(text) => form.text("text", text),
            RequestPayload::Audio(bytes) => form.part(
                "audio",
                Part::bytes(bytes).file_name("audio.webm").mime_str("audio/webm")?,
            ),
        };

        let resp = self.http.post(&self.url).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Transport(format!("HTTP {}", resp.status())));
        }
        let body = resp.bytes().await?;
        if option.yields_text() {
            let parsed: TextResponse = serde_json::from_slice(&body)?;
            Ok(TranslationOutput::Text(parsed.translated_text))
        } else if body.is_empty() {
            Err(Error::transport("malformed response: empty audio"))
        } else {
            Ok(TranslationOutput::Audio(body.to_vec()))
        }
    }
}

#[derive(Clone)]
pub struct TranslationOrchestrator {
    view: Arc<MessageViewModelStore>,
    backend: Arc<dyn TranslationBackend>,
    blobs: Arc<dyn BlobStore>,
    local: LocalAudio,
    notes: Notifications,
}

impl TranslationOrchestrator {
    pub fn new(
        view: Arc<MessageViewModelStore>,
        backend: Arc<dyn TranslationBackend>,
        blobs: Arc<dyn BlobStore>,
        local: LocalAudio,
        notes: Notifications,
    ) -> Self {
        Self {
            view,
            backend,
            blobs,
            local,
            notes,
        }
    }

    /// Translate `message` into `language`. The overlay is `Pending` when this
    /// returns; the handle resolves once the terminal overlay has been written
    /// or discarded.
    pub fn request_translation(
        &self,
        message: &Message,
        mode: TranslationMode,
        language: &str,
    ) -> Result<JoinHandle<()>> {
        if !message.has_content() {
            return Err(Error::validation(format!("message {} has nothing to translate", message.id)));
        }
        if !is_well_formed_language(language) {
            return Err(Error::validation(format!("{language:?} is not a language code")));
        }
        let ticket = self.view.issue_ticket(message)?;
        let replaced = self
            .view
            .apply_overlay_patch(&ticket, TranslationOverlay::pending(mode, language))?;
        self.release(replaced);
        log::debug!(
            "translating {} to {language} ({mode:?}), epoch {}",
            message.id,
            ticket.epoch
        );

        let this = self.clone();
        let message = message.clone();
        let language = language.to_string();
        Ok(tokio::spawn(async move {
            this.complete(ticket, message, mode, language).await;
        }))
    }

    async fn complete(&self, ticket: RequestTicket, message: Message, mode: TranslationMode, language: String) {
        let (overlay, failure) = match self.translate(&message, mode, &language).await {
            Ok(TranslationOutput::Text(text)) if mode == TranslationMode::ToText => {
                (TranslationOverlay::text(&language, text), None)
            }
            Ok(TranslationOutput::Audio(bytes)) if mode == TranslationMode::ToSpeech => {
                let handle = self.local.register(bytes);
                (TranslationOverlay::speech(&language, handle), None)
            }
            Ok(_) => (
                TranslationOverlay::failed(mode, &language),
                Some(Error::transport("malformed response: unexpected output kind")),
            ),
            Err(e) => (TranslationOverlay::failed(mode, &language), Some(e)),
        };

        let handle = overlay.result_audio_ref.clone();
        match self.view.apply_overlay_patch(&ticket, overlay) {
            Ok(replaced) => {
                self.release(replaced);
                match failure {
                    Some(e) => self.notes.error("Translation failed", &e),
                    None => log::debug!("translated {} to {language}", message.id),
                }
            }
            Err(e) => {
                log::debug!("discarding result for {} (epoch {}): {e}", message.id, ticket.epoch);
                if let Some(handle) = handle {
                    self.local.revoke(&handle);
                }
            }
        }
    }

    async fn translate(&self, message: &Message, mode: TranslationMode, language: &str) -> Result<TranslationOutput> {
        let payload = match &message.payload {
            Payload::Text(text) => RequestPayload::Text(text.clone()),
            Payload::Audio(reference) => RequestPayload::Audio(self.fetch_audio(reference).await?),
        };
        self.backend
            .translate(TranslationRequest::new(mode, language, payload))
            .await
    }

    async fn fetch_audio(&self, reference: &str) -> Result<Vec<u8>> {
        if LocalAudio::is_local(reference) {
            return self
                .local
                .resolve(reference)
                .map(|clip| clip.to_vec())
                .ok_or_else(|| Error::transport(format!("{reference} is no longer available")));
        }
        self.blobs.fetch(reference).await
    }

    fn release(&self, replaced: Option<TranslationOverlay>) {
        if let Some(handle) = replaced.and_then(|o| o.result_audio_ref) {
            self.local.revoke(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryStore;
    use crate::notify::Notification;
    use crate::utils::parse_timestamp;
    use crate::view_model::RequestState;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};

    /// Backend whose answers are released by the test, keyed by target language.
    #[derive(Default)]
    struct GatedBackend {
        gates: Mutex<HashMap<String, oneshot::Receiver<Result<TranslationOutput>>>>,
        seen: Mutex<Vec<TranslationRequest>>,
    }

    impl GatedBackend {
        fn gate(&self, language: &str) -> oneshot::Sender<Result<TranslationOutput>> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(language.to_string(), rx);
            tx
        }
    }

    #[async_trait]
    impl TranslationBackend for GatedBackend {
        async fn translate(&self, request: TranslationRequest) -> Result<TranslationOutput> {
            let gate = self.gates.lock().unwrap().remove(&request.language);
            self.seen.lock().unwrap().push(request);
            match gate {
                Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::transport("gate dropped"))),
                None => Err(Error::transport("no answer scripted")),
            }
        }
    }

    struct Fixture {
        view: Arc<MessageViewModelStore>,
        backend: Arc<GatedBackend>,
        store: MemoryStore,
        local: LocalAudio,
        orchestrator: TranslationOrchestrator,
        notes: mpsc::UnboundedReceiver<Notification>,
    }

    fn fixture() -> Fixture {
        let view = Arc::new(MessageViewModelStore::new());
        let backend = Arc::new(GatedBackend::default());
        let store = MemoryStore::new();
        let local = LocalAudio::new();
        let (notify, notes) = Notifications::channel();
        let orchestrator = TranslationOrchestrator::new(
            view.clone(),
            backend.clone(),
            Arc::new(store.clone()),
            local.clone(),
            notify,
        );
        Fixture {
            view,
            backend,
            store,
            local,
            orchestrator,
            notes,
        }
    }

    fn open_with(view: &MessageViewModelStore, payload: Payload) -> Message {
        let token = view.open(&"c1".into());
        let message = Message {
            id: "m1".into(),
            seq: 1,
            conversation_id: "c1".into(),
            sender_id: "bob".into(),
            payload,
            timestamp: parse_timestamp("2025-03-01T09:00:00Z").unwrap(),
        };
        view.apply_base_messages(&token, vec![message.clone()]).unwrap();
        message
    }

    #[tokio::test]
    async fn hola_becomes_hello() {
        let mut f = fixture();
        let message = open_with(&f.view, Payload::Text("Hola".into()));
        let answer = f.backend.gate("en");

        let done = f
            .orchestrator
            .request_translation(&message, TranslationMode::ToText, "en")
            .unwrap();
        let pending = f.view.overlay("m1").unwrap();
        assert_eq!(pending.request_state, RequestState::Pending);
        assert!(pending.result_text.is_none() && pending.result_audio_ref.is_none());

        answer.send(Ok(TranslationOutput::Text("Hello".into()))).unwrap();
        done.await.unwrap();
        let overlay = f.view.overlay("m1").unwrap();
        assert_eq!(overlay.request_state, RequestState::Succeeded);
        assert_eq!(overlay.result_text.as_deref(), Some("Hello"));

        let seen = f.backend.seen.lock().unwrap();
        assert_eq!(seen[0].option, TranslationOption::TextToText);
        assert_eq!(seen[0].payload, RequestPayload::Text("Hola".into()));
        assert!(f.notes.try_recv().is_err());
    }

    #[tokio::test]
    async fn audio_to_speech_yields_a_local_handle() {
        let f = fixture();
        let reference = f.store.store(vec![7, 7, 7], "audio/webm").await.unwrap();
        let message = open_with(&f.view, Payload::Audio(reference));
        f.backend
            .gate("ja")
            .send(Ok(TranslationOutput::Audio(vec![1, 2, 3])))
            .unwrap();

        f.orchestrator
            .request_translation(&message, TranslationMode::ToSpeech, "ja")
            .unwrap()
            .await
            .unwrap();

        let overlay = f.view.overlay("m1").unwrap();
        assert_eq!(overlay.request_state, RequestState::Succeeded);
        let handle = overlay.result_audio_ref.unwrap();
        assert_eq!(f.local.resolve(&handle).as_deref(), Some(&[1u8, 2, 3][..]));
        let seen = f.backend.seen.lock().unwrap();
        assert_eq!(seen[0].option, TranslationOption::SpeechToSpeech);
        assert_eq!(seen[0].payload, RequestPayload::Audio(vec![7, 7, 7]));
    }

    #[tokio::test]
    async fn failure_marks_failed_and_notifies() {
        let mut f = fixture();
        let message = open_with(&f.view, Payload::Text("Hola".into()));
        f.backend
            .gate("en")
            .send(Err(Error::transport("HTTP 500 Internal Server Error")))
            .unwrap();
        f.orchestrator
            .request_translation(&message, TranslationMode::ToText, "en")
            .unwrap()
            .await
            .unwrap();

        let overlay = f.view.overlay("m1").unwrap();
        assert_eq!(overlay.request_state, RequestState::Failed);
        assert!(overlay.result_text.is_none() && overlay.result_audio_ref.is_none());
        assert_eq!(f.notes.try_recv().unwrap().title, "Translation failed");
    }

    #[tokio::test]
    async fn missing_audio_fails_without_calling_backend() {
        let mut f = fixture();
        let message = open_with(&f.view, Payload::Audio("mem://blob/missing".into()));
        f.orchestrator
            .request_translation(&message, TranslationMode::ToText, "es")
            .unwrap()
            .await
            .unwrap();
        assert_eq!(f.view.overlay("m1").unwrap().request_state, RequestState::Failed);
        assert!(f.backend.seen.lock().unwrap().is_empty());
        assert!(f.notes.try_recv().is_ok());
    }

    #[tokio::test]
    async fn late_answer_of_superseded_request_is_dropped() {
        let mut f = fixture();
        let message = open_with(&f.view, Payload::Text("Hola".into()));
        let first = f.backend.gate("it");
        let second = f.backend.gate("ja");

        let r1 = f
            .orchestrator
            .request_translation(&message, TranslationMode::ToSpeech, "it")
            .unwrap();
        let r2 = f
            .orchestrator
            .request_translation(&message, TranslationMode::ToText, "ja")
            .unwrap();

        second.send(Ok(TranslationOutput::Text("konnichiwa".into()))).unwrap();
        r2.await.unwrap();
        first.send(Err(Error::transport("HTTP 500"))).unwrap();
        r1.await.unwrap();

        let overlay = f.view.overlay("m1").unwrap();
        assert_eq!(overlay.request_state, RequestState::Succeeded);
        assert_eq!(overlay.target_language, "ja");
        assert_eq!(overlay.result_text.as_deref(), Some("konnichiwa"));
        assert!(f.notes.try_recv().is_err());
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn result_after_conversation_switch_is_revoked() {
        let f = fixture();
        let message = open_with(&f.view, Payload::Text("Hola".into()));
        let answer = f.backend.gate("hi");
        let done = f
            .orchestrator
            .request_translation(&message, TranslationMode::ToSpeech, "hi")
            .unwrap();
        f.view.open(&"c2".into());
        answer.send(Ok(TranslationOutput::Audio(vec![9]))).unwrap();
        done.await.unwrap();
        assert!(f.view.snapshot().is_empty());
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn bad_input_is_rejected_before_any_request() {
        let f = fixture();
        let message = open_with(&f.view, Payload::Text("Hola".into()));
        for language in ["", "EN", "eng"] {
            assert!(matches!(
                f.orchestrator.request_translation(&message, TranslationMode::ToText, language),
                Err(Error::Validation(_))
            ));
        }
        let mut blank = message.clone();
        blank.payload = Payload::Text("   ".into());
        assert!(matches!(
            f.orchestrator.request_translation(&blank, TranslationMode::ToText, "en"),
            Err(Error::Validation(_))
        ));
        assert!(f.view.overlay("m1").is_none());
    }

    /// Serves one canned HTTP response and hands back the raw request.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/translate", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
            sock.shutdown().await.unwrap();
            request
        });
        (url, task)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&raw[..split]).to_ascii_lowercase();
        let body = &raw[split + 4..];
        match head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(len) => body.len() >= len,
            None => body.ends_with(b"0\r\n\r\n"),
        }
    }

    fn translator(url: String) -> HttpTranslator {
        HttpTranslator::new(&AppConfig {
            translate_url: url,
            ..AppConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn http_text_request_is_a_form_post() {
        let (url, server) = serve_once("200 OK", br#"{"translated_text":"Hello"}"#.to_vec()).await;
        let out = translator(url)
            .translate(TranslationRequest::new(
                TranslationMode::ToText,
                "en",
                RequestPayload::Text("Hola".into()),
            ))
            .await
            .unwrap();
        assert_eq!(out, TranslationOutput::Text("Hello".into()));

        let raw = String::from_utf8_lossy(&server.await.unwrap()).into_owned();
        assert!(raw.starts_with("POST /translate"));
        assert!(raw.contains("name=\"option\"\r\n\r\ntext-to-text"));
        assert!(raw.contains("name=\"language\"\r\n\r\nen"));
        assert!(raw.contains("name=\"text\"\r\n\r\nHola"));
    }

    #[tokio::test]
    async fn http_speech_request_sends_webm_and_returns_bytes() {
        let (url, server) = serve_once("200 OK", vec![0x1a, 0x45, 0xdf, 0xa3]).await;
        let out = translator(url)
            .translate(TranslationRequest::new(
                TranslationMode::ToSpeech,
                "ja",
                RequestPayload::Audio(vec![1, 2, 3]),
            ))
            .await
            .unwrap();
        assert_eq!(out, TranslationOutput::Audio(vec![0x1a, 0x45, 0xdf, 0xa3]));
        let raw = String::from_utf8_lossy(&server.await.unwrap()).into_owned();
        assert!(raw.contains("speech-to-speech"));
        assert!(raw.contains("filename=\"audio.webm\""));
    }

    #[tokio::test]
    async fn http_errors_and_malformed_bodies_fail() {
        let (url, _server) = serve_once("500 Internal Server Error", Vec::new()).await;
        let err = translator(url)
            .translate(TranslationRequest::new(
                TranslationMode::ToText,
                "en",
                RequestPayload::Text("Hola".into()),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(ref m) if m.contains("500")));

        let (url, _server) = serve_once("200 OK", b"<html>".to_vec()).await;
        let err = translator(url)
            .translate(TranslationRequest::new(
                TranslationMode::ToText,
                "en",
                RequestPayload::Text("Hola".into()),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
