//! Seams to the remote collaborators: the document store with its change feed,
//! and the binary object store holding audio.

pub mod client;
pub mod events;
pub mod memory;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::feed::Subscription;
use models::{ConversationRecord, MessageId, MessageRecord, UserProfile};

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Ordered message documents of one conversation. The first emission reflects
    /// the state at subscription time, even when empty.
    fn subscribe_messages(&self, conversation_id: &str) -> Subscription<Vec<MessageRecord>>;

    /// Conversation documents that include `user_id`.
    fn subscribe_conversations(&self, user_id: &str) -> Subscription<Vec<ConversationRecord>>;

    async fn append_message(&self, record: MessageRecord) -> Result<MessageId>;

    /// Update the preview fields of a conversation after a new message.
    async fn touch_conversation(
        &self,
        conversation_id: &str,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_conversation(
        &self,
        user_id: &str,
        other_id: &str,
    ) -> Result<Option<ConversationRecord>>;

    async fn create_conversation(&self, record: ConversationRecord) -> Result<ConversationRecord>;

    async fn get_user(&self, user_id: &str) -> Result<UserProfile>;

    async fn search_users(&self, query: &str) -> Result<Vec<UserProfile>>;
}

/// Durable storage for audio blobs. References are opaque.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn fetch(&self, reference: &str) -> Result<Vec<u8>>;
}
