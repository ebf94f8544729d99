use async_trait::async_trait;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use lingo_bridge::api::client::ApiClient;
use lingo_bridge::api::memory::MemoryStore;
use lingo_bridge::api::models::{MessageRecord, UserProfile};
use lingo_bridge::app::AppConfig;
use lingo_bridge::audio::{AudioOutput, Microphone, NoMicrophone, SilentOutput};
use lingo_bridge::feed::FeedEvent;
use lingo_bridge::index::ConversationSummary;
use lingo_bridge::notify::Notifications;
use lingo_bridge::storage::{self, ConversationCache};
use lingo_bridge::translation::{
    HttpTranslator, RequestPayload, TranslationBackend, TranslationOutput, TranslationRequest,
};
use lingo_bridge::utils::RUNTIME;
use lingo_bridge::view_model::{RequestState, TranslationMode};
use lingo_bridge::{ChatClient, Error, Result, Services, Session};

#[derive(Debug, Parser)]
#[command(name = "lingo-bridge", about = "Headless chat client with on-demand translation")]
struct Cli {
    /// Run against an in-memory store with a scripted conversation.
    #[arg(long)]
    demo: bool,

    #[arg(long, env = "LINGO_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "LINGO_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Config file; defaults to the platform config dir.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target language for the demo translation.
    #[arg(long)]
    language: Option<String>,
}

/// Translator used by `--demo`: tags text with the language, echoes audio back.
struct EchoTranslator;

#[async_trait]
impl TranslationBackend for EchoTranslator {
    async fn translate(&self, request: TranslationRequest) -> Result<TranslationOutput> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(match (request.option.yields_text(), request.payload) {
            (true, RequestPayload::Text(text)) => TranslationOutput::Text(format!("[{}] {text}", request.language)),
            (true, RequestPayload::Audio(bytes)) => {
                TranslationOutput::Text(format!("[{}] <{} bytes of speech>", request.language, bytes.len()))
            }
            (false, RequestPayload::Text(text)) => TranslationOutput::Audio(text.into_bytes()),
            (false, RequestPayload::Audio(bytes)) => TranslationOutput::Audio(bytes),
        })
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn devices() -> (Arc<dyn Microphone>, Arc<dyn AudioOutput>) {
    #[cfg(feature = "device-audio")]
    {
        use lingo_bridge::audio::device::{CpalMicrophone, CpalOutput};
        (Arc::new(CpalMicrophone::new(None)), Arc::new(CpalOutput))
    }
    #[cfg(not(feature = "device-audio"))]
    {
        (Arc::new(NoMicrophone), Arc::new(SilentOutput::new(Duration::from_secs(1))))
    }
}

fn open_cache(config: &AppConfig) -> Option<ConversationCache> {
    if !config.cache_enabled {
        return None;
    }
    let path = storage::default_location()?;
    match ConversationCache::open(&path) {
        Ok(cache) => Some(cache),
        Err(e) => {
            log::warn!("conversation cache disabled: {e}");
            None
        }
    }
}

fn log_index(list: &[ConversationSummary]) {
    log::info!("{} conversation(s)", list.len());
    for summary in list {
        log::info!(
            "  {} | {} | {}",
            summary.participant.display_name(),
            summary.preview(),
            summary.conversation.last_message_time.format("%Y-%m-%d %H:%M")
        );
    }
}

fn profile(uid: &str, name: &str) -> UserProfile {
    UserProfile {
        uid: uid.into(),
        display_name: name.into(),
        email: format!("{uid}@demo.local"),
        photo_url: None,
    }
}

async fn run_demo(config: &AppConfig, language: &str, notes: Notifications) -> Result<()> {
    let store = MemoryStore::new();
    store.add_user(profile("me", "Me"));
    store.add_user(profile("ana", "Ana"));
    let (_, output) = devices();
    let session = Session::new(profile("me", "Me"), None);
    let client = ChatClient::new(
        session,
        Services {
            store: Arc::new(store.clone()),
            blobs: Arc::new(store.clone()),
            translator: Arc::new(EchoTranslator),
            microphone: Arc::new(NoMicrophone),
            output,
            cache: open_cache(config),
        },
        notes,
    );

    let mut list = client.conversations();
    let conversation = client.start_chat("ana").await?;
    client.open_conversation(&conversation.id)?;
    client.send_text("Hi Ana!").await?;
    store.insert_message(MessageRecord::new_text(&conversation.id, "ana", "Hola, ¿qué tal?", chrono::Utc::now()));

    let mut view = client.messages();
    let incoming = loop {
        let snapshot = view.borrow_and_update().clone();
        if let Some(m) = snapshot.iter().find(|m| m.message.sender_id == "ana") {
            break m.message.id.clone();
        }
        view.changed().await.map_err(|_| Error::transport("view closed"))?;
    };

    client.translate(&incoming, TranslationMode::ToText, language)?.await.map_err(|e| Error::transport(e.to_string()))?;
    for m in client.snapshot().iter() {
        let translated = match &m.overlay {
            Some(o) if o.request_state == RequestState::Succeeded => o.result_text.clone().unwrap_or_default(),
            Some(o) => format!("{:?}", o.request_state),
            None => String::new(),
        };
        log::info!("{}: {} {}", m.message.sender_id, m.message.text().unwrap_or("<audio>"), translated);
    }

    client.translate(&incoming, TranslationMode::ToSpeech, language)?.await.map_err(|e| Error::transport(e.to_string()))?;
    if let Err(e) = client.play_translation(&incoming) {
        log::warn!("cannot play translation: {e}");
    }

    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(300), list.next()).await {
        match event {
            FeedEvent::Snapshot(summaries) => log_index(&summaries),
            FeedEvent::Error(e) => log::warn!("conversation list: {e}"),
        }
    }
    client.shutdown();
    Ok(())
}

async fn run_remote(
    config: AppConfig,
    config_path: Option<&Path>,
    email: &str,
    password: &str,
    notes: Notifications,
) -> Result<()> {
    config.validate()?;
    let mut api = ApiClient::new(&config)?;
    let session = api.sign_in(email, password).await?;
    if let Err(e) = AppConfig::save_token(session.token(), config_path) {
        log::warn!("sign-in token not saved: {e}");
    }
    let (microphone, output) = devices();
    let cache = open_cache(&config);
    let client = ChatClient::new(
        session,
        Services {
            store: Arc::new(api.clone()),
            blobs: Arc::new(api.clone()),
            translator: Arc::new(HttpTranslator::new(&config)?),
            microphone,
            output,
            cache,
        },
        notes,
    );

    match client.index().cached(Some(20)) {
        Ok(cached) if !cached.is_empty() => log_index(&cached),
        Ok(_) => {}
        Err(e) => log::debug!("no cached conversations: {e}"),
    }

    let mut list = client.conversations();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = list.next() => match event {
                Some(FeedEvent::Snapshot(summaries)) => log_index(&summaries),
                Some(FeedEvent::Error(e)) => log::warn!("conversation list: {e}"),
                None => break,
            },
        }
    }

    client.shutdown();
    if let Err(e) = api.sign_out().await {
        log::warn!("sign out failed: {e}");
    }
    if let Err(e) = AppConfig::save_token(None, config_path) {
        log::warn!("stored token not cleared: {e}");
    }
    Ok(())
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let (notes, mut notices) = Notifications::channel();
    tokio::spawn(async move {
        while let Some(n) = notices.recv().await {
            println!("[{:?}] {}: {}", n.severity, n.title, n.detail);
        }
    });

    let language = cli.language.unwrap_or_else(|| config.default_language.clone());
    if cli.demo {
        return run_demo(&config, &language, notes).await;
    }
    match (cli.email, cli.password) {
        (Some(email), Some(password)) => {
            run_remote(config, cli.config.as_deref(), &email, &password, notes).await
        }
        _ => Err(Error::validation("--email and --password are required without --demo")),
    }
}

fn main() {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from_with_env(path).unwrap_or_else(|e| {
            eprintln!("cannot read {}: {e}", path.display());
            std::process::exit(2);
        }),
        None => AppConfig::load_with_env(),
    };
    init_logging(&config);

    if let Err(e) = RUNTIME.block_on(run(cli, config)) {
        log::error!("{e}");
        std::process::exit(1);
    }
}
