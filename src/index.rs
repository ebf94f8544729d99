//! Conversation list of the signed-in user, most recent first.

use futures_util::future::join_all;
use std::sync::Arc;

use crate::api::RemoteStore;
use crate::api::models::{Conversation, ConversationRecord, UserId, UserProfile};
use crate::error::Result;
use crate::feed::Subscription;
use crate::session::Session;
use crate::storage::ConversationCache;

pub const UNKNOWN_USER: &str = "Unknown User";
pub const EMPTY_PREVIEW: &str = "Start a conversation";

/// The other member of a conversation, as far as we could resolve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Participant {
    Known(UserProfile),
    Unknown(UserId),
}

impl Participant {
    pub fn uid(&self) -> &str {
        match self {
            Participant::Known(user) => &user.uid,
            Participant::Unknown(uid) => uid,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Participant::Known(user) if !user.display_name.trim().is_empty() => &user.display_name,
            _ => UNKNOWN_USER,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Participant::Known(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub participant: Participant,
}

impl ConversationSummary {
    pub fn id(&self) -> &str {
        &self.conversation.id
    }

    pub fn preview(&self) -> &str {
        let preview = self.conversation.last_message_preview.as_str();
        if preview.is_empty() { EMPTY_PREVIEW } else { preview }
    }
}

/// Newest first; equal times by id so the order is deterministic.
pub fn order_summaries(list: &mut [ConversationSummary]) {
    list.sort_by(|a, b| {
        b.conversation
            .last_message_time
            .cmp(&a.conversation.last_message_time)
            .then_with(|| a.conversation.id.cmp(&b.conversation.id))
    });
}

/// Case-insensitive match on the other participant's name. A non-empty query
/// never matches unresolved participants.
pub fn filter_by_name(list: &[ConversationSummary], query: &str) -> Vec<ConversationSummary> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return list.to_vec();
    }
    list.iter()
        .filter(|s| match &s.participant {
            Participant::Known(user) => user.display_name.to_lowercase().contains(&needle),
            Participant::Unknown(_) => false,
        })
        .cloned()
        .collect()
}

async fn resolve(store: &dyn RemoteStore, me: &str, records: Vec<ConversationRecord>) -> Vec<ConversationSummary> {
    let conversations: Vec<Conversation> = records
        .into_iter()
        .filter_map(ConversationRecord::normalize)
        .filter(|c| c.participants.contains(me))
        .collect();

    let lookups = conversations.into_iter().map(|conversation| async move {
        let other = conversation.participants.other(me).unwrap_or(me).to_string();
        let participant = match store.get_user(&other).await {
            Ok(user) => Participant::Known(user),
            Err(e) => {
                log::warn!("conversation {}: cannot resolve {other}: {e}", conversation.id);
                Participant::Unknown(other)
            }
        };
        ConversationSummary {
            conversation,
            participant,
        }
    });
    let mut list = join_all(lookups).await;
    order_summaries(&mut list);
    list
}

#[derive(Clone)]
pub struct ConversationIndexSync {
    store: Arc<dyn RemoteStore>,
    cache: Option<ConversationCache>,
}

impl ConversationIndexSync {
    pub fn new(store: Arc<dyn RemoteStore>, cache: Option<ConversationCache>) -> Self {
        Self { store, cache }
    }

    /// Conversations containing the session user. Every snapshot carries resolved
    /// participants and is written through to the cache.
    pub fn subscribe(&self, session: &Session) -> Subscription<Vec<ConversationSummary>> {
        let me = session.user_id().clone();
        log::debug!("subscribing to conversations of {me}");
        let store = self.store.clone();
        let cache = self.cache.clone();
        self.store
            .subscribe_conversations(&me)
            .then_snapshots(move |records| {
                let store = store.clone();
                let cache = cache.clone();
                let me = me.clone();
                async move {
                    let list = resolve(store.as_ref(), &me, records).await;
                    if let Some(cache) = cache {
                        let rows = list.clone();
                        match tokio::task::spawn_blocking(move || cache.replace(&rows)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => log::warn!("conversation cache not updated: {e}"),
                            Err(e) => log::warn!("conversation cache writer failed: {e}"),
                        }
                    }
                    list
                }
            })
    }

    /// Last list seen by any previous run, empty without a cache.
    pub fn cached(&self, limit: Option<usize>) -> Result<Vec<ConversationSummary>> {
        match &self.cache {
            Some(cache) => cache.cached(limit),
            None => Ok(Vec::new()),
        }
    }
}
