//! What is on screen: base messages of the open conversation joined with their
//! client-local translation overlays.
//!
//! The store is mutated only through [`MessageViewModelStore::apply_base_messages`]
//! and [`MessageViewModelStore::apply_overlay_patch`]. Every mutation happens under
//! one lock and publishes a complete merged snapshot, so readers never observe a
//! half-applied change.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::api::models::{ConversationId, Message, MessageId};
use crate::error::{Error, Result};
use crate::feed::order_messages;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Idle,
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranslationMode {
    ToText,
    ToSpeech,
}

/// Client-local translation state of one message. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationOverlay {
    pub request_state: RequestState,
    pub mode: TranslationMode,
    pub target_language: String,
    pub result_text: Option<String>,
    pub result_audio_ref: Option<String>,
}

impl TranslationOverlay {
    fn empty(state: RequestState, mode: TranslationMode, language: &str) -> Self {
        Self {
            request_state: state,
            mode,
            target_language: language.to_string(),
            result_text: None,
            result_audio_ref: None,
        }
    }

    pub fn pending(mode: TranslationMode, language: &str) -> Self {
        Self::empty(RequestState::Pending, mode, language)
    }

    pub fn failed(mode: TranslationMode, language: &str) -> Self {
        Self::empty(RequestState::Failed, mode, language)
    }

    pub fn text(language: &str, text: String) -> Self {
        Self {
            result_text: Some(text),
            ..Self::empty(RequestState::Succeeded, TranslationMode::ToText, language)
        }
    }

    pub fn speech(language: &str, audio_ref: String) -> Self {
        Self {
            result_audio_ref: Some(audio_ref),
            ..Self::empty(RequestState::Succeeded, TranslationMode::ToSpeech, language)
        }
    }
}

/// A base message and its live overlay, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewMessage {
    pub message: Message,
    pub overlay: Option<TranslationOverlay>,
}

/// Identifies one opening of a conversation. A conversation closed and reopened
/// gets a new generation, so leftovers of the first opening stay stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationToken {
    pub conversation_id: ConversationId,
    pub generation: u64,
}

/// Issued per translation request. Only the newest ticket of a message may
/// write its overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTicket {
    pub conversation: ConversationToken,
    pub message_id: MessageId,
    pub epoch: u64,
}

#[derive(Default)]
struct Inner {
    active: Option<ConversationToken>,
    generation: u64,
    base: Vec<Message>,
    overlays: HashMap<MessageId, TranslationOverlay>,
    epochs: HashMap<MessageId, u64>,
}

impl Inner {
    fn is_current(&self, token: &ConversationToken) -> bool {
        self.active.as_ref() == Some(token)
    }

    fn knows(&self, message_id: &str) -> bool {
        self.base.iter().any(|m| m.id == message_id)
    }

    fn merged(&self) -> Arc<[ViewMessage]> {
        self.base
            .iter()
            .map(|m| ViewMessage {
                message: m.clone(),
                overlay: self.overlays.get(&m.id).cloned(),
            })
            .collect()
    }
}

pub struct MessageViewModelStore {
    inner: Mutex<Inner>,
    published: watch::Sender<Arc<[ViewMessage]>>,
}

impl Default for MessageViewModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageViewModelStore {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Arc::from(Vec::new()));
        Self {
            inner: Mutex::new(Inner::default()),
            published,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, inner: &Inner) {
        self.published.send_replace(inner.merged());
    }

    /// Make `conversation_id` the active conversation. Everything belonging to
    /// the previous one is dropped and its outstanding tokens become stale.
    pub fn open(&self, conversation_id: &ConversationId) -> ConversationToken {
        let mut inner = self.lock();
        inner.generation += 1;
        let token = ConversationToken {
            conversation_id: conversation_id.clone(),
            generation: inner.generation,
        };
        inner.active = Some(token.clone());
        inner.base.clear();
        inner.overlays.clear();
        inner.epochs.clear();
        self.publish(&inner);
        log::debug!("view model opened {conversation_id} (generation {})", token.generation);
        token
    }

    pub fn close(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.active = None;
        inner.base.clear();
        inner.overlays.clear();
        inner.epochs.clear();
        self.publish(&inner);
    }

    pub fn active(&self) -> Option<ConversationToken> {
        self.lock().active.clone()
    }

    /// Replace the base layer. Overlays of messages still present survive;
    /// the rest are dropped.
    pub fn apply_base_messages(&self, token: &ConversationToken, mut messages: Vec<Message>) -> Result<()> {
        let mut inner = self.lock();
        if !inner.is_current(token) {
            log::debug!("discarding base snapshot for stale {}", token.conversation_id);
            return Err(Error::StaleResult);
        }
        order_messages(&mut messages);
        let present: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        inner.overlays.retain(|id, _| present.contains(id.as_str()));
        inner.base = messages;
        self.publish(&inner);
        Ok(())
    }

    /// Start a new request epoch for a message of the active conversation.
    pub fn issue_ticket(&self, message: &Message) -> Result<RequestTicket> {
        let mut inner = self.lock();
        let Some(active) = inner.active.clone() else {
            return Err(Error::validation("no conversation is open"));
        };
        if message.conversation_id != active.conversation_id || !inner.knows(&message.id) {
            return Err(Error::validation(format!(
                "message {} is not in the open conversation",
                message.id
            )));
        }
        let epoch = inner.epochs.entry(message.id.clone()).or_insert(0);
        *epoch += 1;
        Ok(RequestTicket {
            conversation: active,
            message_id: message.id.clone(),
            epoch: *epoch,
        })
    }

    /// Replace the overlay of the ticket's message and return the one it replaced.
    /// Rejected as stale when the conversation changed, the message is gone, or a
    /// newer ticket exists.
    pub fn apply_overlay_patch(
        &self,
        ticket: &RequestTicket,
        overlay: TranslationOverlay,
    ) -> Result<Option<TranslationOverlay>> {
        let mut inner = self.lock();
        if !inner.is_current(&ticket.conversation) || !inner.knows(&ticket.message_id) {
            return Err(Error::StaleResult);
        }
        let latest = inner.epochs.get(&ticket.message_id).copied().unwrap_or(0);
        if ticket.epoch < latest {
            return Err(Error::StaleResult);
        }
        let replaced = inner.overlays.insert(ticket.message_id.clone(), overlay);
        self.publish(&inner);
        Ok(replaced)
    }

    pub fn snapshot(&self) -> Arc<[ViewMessage]> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<[ViewMessage]>> {
        self.published.subscribe()
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.lock().base.iter().find(|m| m.id == message_id).cloned()
    }

    pub fn overlay(&self, message_id: &str) -> Option<TranslationOverlay> {
        self.lock().overlays.get(message_id).cloned()
    }
}
