//! In-process store used by tests and the demo binary.
//!
//! Behaves like the remote document store: every write pushes a fresh snapshot
//! to the matching subscribers, and conversation creation is atomic on the
//! participant pair key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::models::{ConversationRecord, MessageId, MessageRecord, UserProfile};
use crate::api::{BlobStore, RemoteStore};
use crate::error::{Error, Result};
use crate::feed::{self, FeedSender, Subscription};
use crate::utils::format_timestamp;

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    next_id: u64,
    messages: Vec<MessageRecord>,
    conversations: Vec<ConversationRecord>,
    users: HashMap<String, UserProfile>,
    blobs: HashMap<String, Vec<u8>>,
    message_watchers: Vec<(String, FeedSender<Vec<MessageRecord>>)>,
    conversation_watchers: Vec<(String, FeedSender<Vec<ConversationRecord>>)>,
    offline: bool,
    failing_uploads: usize,
    missing_users: HashSet<String>,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn messages_of(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    fn conversations_of(&self, user_id: &str) -> Vec<ConversationRecord> {
        self.conversations
            .iter()
            .filter(|c| c.participants.contains(user_id))
            .cloned()
            .collect()
    }

    fn publish_messages(&mut self, conversation_id: &str) {
        let snapshot = self.messages_of(conversation_id);
        self.message_watchers.retain(|(id, tx)| {
            if id != conversation_id {
                return !tx.is_closed();
            }
            tx.snapshot(snapshot.clone())
        });
    }

    fn publish_conversations(&mut self) {
        let watchers = std::mem::take(&mut self.conversation_watchers);
        for (user, tx) in watchers {
            if tx.snapshot(self.conversations_of(&user)) {
                self.conversation_watchers.push((user, tx));
            }
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline {
            Err(Error::transport("store unreachable"))
        } else {
            Ok(())
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_user(&self, user: UserProfile) {
        self.lock().users.insert(user.uid.clone(), user);
    }

    /// Insert a raw message document, assigning id and sequence when absent.
    pub fn insert_message(&self, mut record: MessageRecord) -> MessageId {
        let mut inner = self.lock();
        inner.next_seq += 1;
        if record.seq == 0 {
            record.seq = inner.next_seq;
        }
        let id = match record.id.clone().filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => inner.next_id("m"),
        };
        record.id = Some(id.clone());
        let conversation_id = record.conversation_id.clone();
        inner.messages.push(record);
        inner.publish_messages(&conversation_id);
        id
    }

    /// Make every call fail with a transport error and break open feeds.
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.lock();
        inner.offline = offline;
        if offline {
            for (_, tx) in &inner.message_watchers {
                tx.error(Error::transport("store unreachable"));
            }
            for (_, tx) in &inner.conversation_watchers {
                tx.error(Error::transport("store unreachable"));
            }
        }
    }

    pub fn fail_next_uploads(&self, count: usize) {
        self.lock().failing_uploads = count;
    }

    /// Make `get_user` fail for this id.
    pub fn hide_user(&self, user_id: &str) {
        self.lock().missing_users.insert(user_id.to_string());
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.lock().messages_of(conversation_id)
    }

    pub fn conversations(&self) -> Vec<ConversationRecord> {
        self.lock().conversations.clone()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn message_watcher_count(&self) -> usize {
        self.lock()
            .message_watchers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn subscribe_messages(&self, conversation_id: &str) -> Subscription<Vec<MessageRecord>> {
        let (tx, sub) = feed::channel();
        let mut inner = self.lock();
        if inner.offline {
            tx.error(Error::transport("store unreachable"));
            return sub;
        }
        tx.snapshot(inner.messages_of(conversation_id));
        inner.message_watchers.push((conversation_id.to_string(), tx));
        sub
    }

    fn subscribe_conversations(&self, user_id: &str) -> Subscription<Vec<ConversationRecord>> {
        let (tx, sub) = feed::channel();
        let mut inner = self.lock();
        if inner.offline {
            tx.error(Error::transport("store unreachable"));
            return sub;
        }
        tx.snapshot(inner.conversations_of(user_id));
        inner.conversation_watchers.push((user_id.to_string(), tx));
        sub
    }

    async fn append_message(&self, mut record: MessageRecord) -> Result<MessageId> {
        self.lock().check_online()?;
        record.id = None;
        record.seq = 0;
        Ok(self.insert_message(record))
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.check_online()?;
        let conv = inner
            .conversations
            .iter_mut()
            .find(|c| c.id.as_deref() == Some(conversation_id))
            .ok_or_else(|| Error::transport(format!("HTTP 404 conversation {conversation_id}")))?;
        conv.last_message = preview.to_string();
        conv.last_message_time = format_timestamp(at);
        inner.publish_conversations();
        Ok(())
    }

    async fn find_conversation(
        &self,
        user_id: &str,
        other_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        let inner = self.lock();
        inner.check_online()?;
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.participants.contains(user_id) && c.participants.contains(other_id))
            .cloned())
    }

    async fn create_conversation(&self, mut record: ConversationRecord) -> Result<ConversationRecord> {
        let mut inner = self.lock();
        inner.check_online()?;
        let key = record.participants.pair_key();
        if let Some(existing) = inner.conversations.iter().find(|c| c.pair_key == key) {
            return Ok(existing.clone());
        }
        record.pair_key = key;
        record.id = Some(inner.next_id("c"));
        inner.conversations.push(record.clone());
        inner.publish_conversations();
        Ok(record)
    }

    async fn get_user(&self, user_id: &str) -> Result<UserProfile> {
        let inner = self.lock();
        inner.check_online()?;
        if inner.missing_users.contains(user_id) {
            return Err(Error::transport(format!("HTTP 404 user {user_id}")));
        }
        inner
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::transport(format!("HTTP 404 user {user_id}")))
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserProfile>> {
        let inner = self.lock();
        inner.check_online()?;
        Ok(inner
            .users
            .values()
            .filter(|u| u.display_name.starts_with(query) || u.email.starts_with(query))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn store(&self, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        let mut inner = self.lock();
        inner.check_online()?;
        if inner.failing_uploads > 0 {
            inner.failing_uploads -= 1;
            return Err(Error::transport("HTTP 503 upload rejected"));
        }
        let reference = format!("mem://blob/{}", inner.next_id("b"));
        inner.blobs.insert(reference.clone(), bytes);
        Ok(reference)
    }

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        let inner = self.lock();
        inner.check_online()?;
        inner
            .blobs
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::transport(format!("HTTP 404 {reference}")))
    }
}
