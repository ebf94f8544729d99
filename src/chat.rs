//! Sending messages, starting chats, and the [`ChatClient`] that wires every
//! component to one signed-in session.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::models::{
    AUDIO_PREVIEW, Conversation, ConversationId, ConversationRecord, MessageId, MessageRecord,
    Participants, Payload, UserProfile,
};
use crate::api::{BlobStore, RemoteStore};
use crate::audio::{AudioOutput, AudioPipeline, LocalAudio, Microphone, PlaybackManager, SlotKey};
use crate::error::{Error, Result};
use crate::feed::{CancelHandle, ChangeFeedSubscriber, FeedEvent, Subscription};
use crate::index::{ConversationIndexSync, ConversationSummary};
use crate::notify::Notifications;
use crate::session::Session;
use crate::storage::ConversationCache;
use crate::translation::{TranslationBackend, TranslationOrchestrator};
use crate::view_model::{ConversationToken, MessageViewModelStore, TranslationMode, ViewMessage};

/// Appends messages as the session user and keeps the conversation preview current.
#[derive(Clone)]
pub struct MessagePoster {
    store: Arc<dyn RemoteStore>,
    session: Session,
    notes: Notifications,
}

impl MessagePoster {
    pub fn new(store: Arc<dyn RemoteStore>, session: Session, notes: Notifications) -> Self {
        Self { store, session, notes }
    }

    /// Append without raising notifications.
    pub async fn send(&self, conversation_id: &ConversationId, payload: Payload) -> Result<MessageId> {
        if conversation_id.is_empty() {
            return Err(Error::validation("no conversation selected"));
        }
        let at = Utc::now();
        let me = self.session.user_id();
        let (record, preview) = match &payload {
            Payload::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(Error::validation("message is empty"));
                }
                (MessageRecord::new_text(conversation_id, me, text, at), text.to_string())
            }
            Payload::Audio(url) => {
                if url.trim().is_empty() {
                    return Err(Error::validation("audio reference is empty"));
                }
                (MessageRecord::new_audio(conversation_id, me, url, at), AUDIO_PREVIEW.to_string())
            }
        };
        let id = self.store.append_message(record).await?;
        if let Err(e) = self.store.touch_conversation(conversation_id, &preview, at).await {
            log::warn!("message {id} sent but preview of {conversation_id} not updated: {e}");
        }
        log::debug!("sent {id} to {conversation_id}");
        Ok(id)
    }

    pub async fn post_text(&self, conversation_id: &ConversationId, text: &str) -> Result<MessageId> {
        self.post(conversation_id, Payload::Text(text.to_string())).await
    }

    pub async fn post_audio(&self, conversation_id: &ConversationId, audio_url: &str) -> Result<MessageId> {
        self.post(conversation_id, Payload::Audio(audio_url.to_string())).await
    }

    async fn post(&self, conversation_id: &ConversationId, payload: Payload) -> Result<MessageId> {
        let result = self.send(conversation_id, payload).await;
        if let Err(e) = &result {
            if !matches!(e, Error::Validation(_)) {
                self.notes.error("Failed to send message", e);
            }
        }
        result
    }
}

/// Find the conversation with `other`, creating it when there is none.
pub async fn start_chat(store: &dyn RemoteStore, session: &Session, other: &str) -> Result<Conversation> {
    let participants = Participants::new(session.user_id(), other.trim())?;
    let [me, other] = participants.ids();
    let record = match store.find_conversation(me, other).await? {
        Some(existing) => existing,
        None => {
            log::info!("starting a conversation between {me} and {other}");
            store
                .create_conversation(ConversationRecord::new(participants.clone(), Utc::now()))
                .await?
        }
    };
    record
        .normalize()
        .ok_or_else(|| Error::transport("malformed response: conversation without id or time"))
}

/// Users matching `query`, without the session user, sorted by name.
pub async fn search_users(store: &dyn RemoteStore, session: &Session, query: &str) -> Result<Vec<UserProfile>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let mut seen = HashSet::new();
    let mut users: Vec<UserProfile> = store
        .search_users(query)
        .await?
        .into_iter()
        .filter(|u| u.uid != *session.user_id())
        .filter(|u| seen.insert(u.uid.clone()))
        .collect();
    users.sort_by(|a, b| {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.uid.cmp(&b.uid))
    });
    Ok(users)
}

/// External collaborators of a [`ChatClient`].
pub struct Services {
    pub store: Arc<dyn RemoteStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub translator: Arc<dyn TranslationBackend>,
    pub microphone: Arc<dyn Microphone>,
    pub output: Arc<dyn AudioOutput>,
    pub cache: Option<ConversationCache>,
}

struct OpenConversation {
    token: ConversationToken,
    feed: CancelHandle,
}

/// Everything one signed-in user needs. Built on sign-in, torn down with
/// [`ChatClient::shutdown`] on sign-out.
pub struct ChatClient {
    session: Session,
    store: Arc<dyn RemoteStore>,
    view: Arc<MessageViewModelStore>,
    feed: ChangeFeedSubscriber,
    translations: TranslationOrchestrator,
    playback: PlaybackManager,
    audio: AudioPipeline,
    index: ConversationIndexSync,
    poster: MessagePoster,
    local: LocalAudio,
    notes: Notifications,
    open: Mutex<Option<OpenConversation>>,
    lists: Mutex<Vec<CancelHandle>>,
}

impl ChatClient {
    pub fn new(session: Session, services: Services, notes: Notifications) -> Self {
        let Services {
            store,
            blobs,
            translator,
            microphone,
            output,
            cache,
        } = services;
        let view = Arc::new(MessageViewModelStore::new());
        let local = LocalAudio::new();
        let poster = MessagePoster::new(store.clone(), session.clone(), notes.clone());
        Self {
            feed: ChangeFeedSubscriber::new(store.clone()),
            translations: TranslationOrchestrator::new(
                view.clone(),
                translator,
                blobs.clone(),
                local.clone(),
                notes.clone(),
            ),
            playback: PlaybackManager::new(output, blobs.clone(), local.clone(), notes.clone()),
            audio: AudioPipeline::new(microphone, blobs, poster.clone(), local.clone(), notes.clone()),
            index: ConversationIndexSync::new(store.clone(), cache),
            session,
            store,
            view,
            poster,
            local,
            notes,
            open: Mutex::new(None),
            lists: Mutex::new(Vec::new()),
        }
    }

    fn open_slot(&self) -> MutexGuard<'_, Option<OpenConversation>> {
        match self.open.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn playback(&self) -> &PlaybackManager {
        &self.playback
    }

    pub fn audio(&self) -> &AudioPipeline {
        &self.audio
    }

    pub fn index(&self) -> &ConversationIndexSync {
        &self.index
    }

    pub fn messages(&self) -> watch::Receiver<Arc<[ViewMessage]>> {
        self.view.subscribe()
    }

    pub fn snapshot(&self) -> Arc<[ViewMessage]> {
        self.view.snapshot()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.open_slot().as_ref().map(|o| o.token.conversation_id.clone())
    }

    fn require_active(&self) -> Result<ConversationId> {
        self.active_conversation()
            .ok_or_else(|| Error::validation("no conversation is open"))
    }

    /// Switch the view to `conversation_id`. Whatever belonged to the previous
    /// conversation (feed, overlays, translated audio, playback, draft) is dropped.
    pub fn open_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        if conversation_id.trim().is_empty() {
            return Err(Error::validation("conversation id is empty"));
        }
        let mut open = self.open_slot();
        self.teardown(open.take());
        let token = self.view.open(conversation_id);

        let mut sub = self.feed.subscribe(conversation_id);
        let feed = sub.cancel_handle();
        let view = self.view.clone();
        let notes = self.notes.clone();
        let pump_token = token.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                match event {
                    FeedEvent::Snapshot(messages) => {
                        if view.apply_base_messages(&pump_token, messages).is_err() {
                            break;
                        }
                    }
                    FeedEvent::Error(e) => notes.error("Connection lost", &e),
                }
            }
        });
        feed.bind_task(pump.abort_handle());
        *open = Some(OpenConversation { token, feed });
        log::info!("opened conversation {conversation_id}");
        Ok(())
    }

    pub fn close_conversation(&self) {
        let mut open = self.open_slot();
        if let Some(previous) = open.take() {
            self.teardown(Some(previous));
            self.view.close();
        }
    }

    fn teardown(&self, previous: Option<OpenConversation>) {
        if let Some(previous) = previous {
            previous.feed.cancel();
            log::debug!("closed conversation {}", previous.token.conversation_id);
        }
        self.playback.stop_all();
        self.audio.abandon();
        self.local.clear();
    }

    /// Translate a message of the open conversation.
    pub fn translate(&self, message_id: &str, mode: TranslationMode, language: &str) -> Result<JoinHandle<()>> {
        let message = self
            .view
            .message(message_id)
            .ok_or_else(|| Error::validation(format!("message {message_id} is not on screen")))?;
        self.translations.request_translation(&message, mode, language)
    }

    pub async fn send_text(&self, text: &str) -> Result<MessageId> {
        let conversation_id = self.require_active()?;
        self.poster.post_text(&conversation_id, text).await
    }

    pub fn start_recording(&self) -> Result<()> {
        self.audio.start()
    }

    pub fn stop_recording(&self) -> Result<String> {
        self.audio.stop()
    }

    pub fn discard_recording(&self) -> Result<()> {
        self.playback.stop(&SlotKey::Draft);
        self.audio.discard()
    }

    pub async fn send_recording(&self) -> Result<MessageId> {
        let conversation_id = self.require_active()?;
        self.playback.stop(&SlotKey::Draft);
        self.audio.send(&conversation_id).await
    }

    pub fn play_original(&self, message_id: &str) -> Result<()> {
        let reference = self
            .view
            .message(message_id)
            .and_then(|m| m.audio_ref().map(str::to_string))
            .ok_or_else(|| Error::validation(format!("message {message_id} has no audio")))?;
        self.playback.play(&reference, SlotKey::Original(message_id.to_string()))
    }

    pub fn play_translation(&self, message_id: &str) -> Result<()> {
        let reference = self
            .view
            .overlay(message_id)
            .and_then(|o| o.result_audio_ref)
            .ok_or_else(|| Error::validation(format!("message {message_id} has no translated audio")))?;
        self.playback.play(&reference, SlotKey::Translation(message_id.to_string()))
    }

    pub fn play_draft(&self) -> Result<()> {
        let handle = self
            .audio
            .draft()
            .ok_or_else(|| Error::validation("no recording to play"))?;
        self.playback.play(&handle, SlotKey::Draft)
    }

    pub fn stop(&self, slot: &SlotKey) {
        self.playback.stop(slot);
    }

    /// Live conversation list. Cancelled by [`ChatClient::shutdown`] at the latest.
    pub fn conversations(&self) -> Subscription<Vec<ConversationSummary>> {
        let sub = self.index.subscribe(&self.session);
        match self.lists.lock() {
            Ok(mut lists) => lists.push(sub.cancel_handle()),
            Err(poisoned) => poisoned.into_inner().push(sub.cancel_handle()),
        }
        sub
    }

    pub async fn start_chat(&self, other: &str) -> Result<Conversation> {
        let result = start_chat(self.store.as_ref(), &self.session, other).await;
        if let Err(e) = &result {
            if matches!(e, Error::Transport(_)) {
                self.notes.error("Failed to start chat", e);
            }
        }
        result
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserProfile>> {
        search_users(self.store.as_ref(), &self.session, query).await
    }

    /// Sign-out teardown: every subscription is cancelled and every overlay dropped.
    pub fn shutdown(&self) {
        self.close_conversation();
        let lists = match self.lists.lock() {
            Ok(mut lists) => std::mem::take(&mut *lists),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in lists {
            handle.cancel();
        }
        self.playback.stop_all();
        self.audio.abandon();
        self.local.clear();
        log::info!("session of {} closed", self.session.user_id());
    }
}
