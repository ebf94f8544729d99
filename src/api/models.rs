use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::{format_timestamp, parse_timestamp};

pub type MessageId = String;
pub type ConversationId = String;
pub type UserId = String;

/// Conversation preview used for audio messages.
pub const AUDIO_PREVIEW: &str = "🎤 Audio message";

/// The single payload a message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Audio(String),
}

/// Base message as delivered by the change feed. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Store-assigned sequence, breaks timestamp ties.
    pub seq: u64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(t) => Some(t),
            Payload::Audio(_) => None,
        }
    }

    pub fn audio_ref(&self) -> Option<&str> {
        match &self.payload {
            Payload::Audio(r) => Some(r),
            Payload::Text(_) => None,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.payload, Payload::Audio(_))
    }

    pub fn has_content(&self) -> bool {
        match &self.payload {
            Payload::Text(t) => !t.trim().is_empty(),
            Payload::Audio(r) => !r.trim().is_empty(),
        }
    }
}

/// Message document as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub seq: u64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

impl MessageRecord {
    pub fn new_text(conversation_id: &str, sender_id: &str, text: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            seq: 0,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: format_timestamp(at),
            text: Some(text.to_string()),
            audio_url: None,
        }
    }

    pub fn new_audio(conversation_id: &str, sender_id: &str, audio_url: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            seq: 0,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: format_timestamp(at),
            text: None,
            audio_url: Some(audio_url.to_string()),
        }
    }

    /// Turn a remote record into a base message. Records without an id, without a
    /// payload, or with an unreadable timestamp are dropped.
    pub fn normalize(self) -> Option<Message> {
        let id = match self.id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                log::warn!("dropping message record without id in {}", self.conversation_id);
                return None;
            }
        };
        let Some(timestamp) = parse_timestamp(&self.timestamp) else {
            log::warn!("dropping message {id}: bad timestamp {:?}", self.timestamp);
            return None;
        };
        let audio = self.audio_url.filter(|u| !u.trim().is_empty());
        let text = self.text.filter(|t| !t.trim().is_empty());
        let payload = match (audio, text) {
            (Some(url), _) => Payload::Audio(url),
            (None, Some(text)) => Payload::Text(text),
            (None, None) => {
                log::warn!("dropping message {id}: no text or audio");
                return None;
            }
        };
        Some(Message {
            id,
            seq: self.seq,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            payload,
            timestamp,
        })
    }
}

/// The two members of a conversation. Order-irrelevant, always two distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Participants([UserId; 2]);

impl Participants {
    pub fn new(a: &str, b: &str) -> Result<Self> {
        if a.is_empty() || b.is_empty() {
            return Err(Error::validation("participant id is empty"));
        }
        if a == b {
            return Err(Error::validation("a conversation needs two different users"));
        }
        Ok(Self([a.to_string(), b.to_string()]))
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.0.iter().any(|p| p == user_id)
    }

    /// The participant that is not `me`, if `me` takes part at all.
    pub fn other(&self, me: &str) -> Option<&str> {
        let [a, b] = &self.0;
        if a == me {
            Some(b.as_str())
        } else if b == me {
            Some(a.as_str())
        } else {
            None
        }
    }

    /// Deterministic key for the unordered pair.
    pub fn pair_key(&self) -> String {
        let mut ids = [self.0[0].as_str(), self.0[1].as_str()];
        ids.sort_unstable();
        format!("{}:{}", ids[0], ids[1])
    }

    pub fn ids(&self) -> &[UserId; 2] {
        &self.0
    }
}

impl TryFrom<Vec<String>> for Participants {
    type Error = Error;

    fn try_from(ids: Vec<String>) -> Result<Self> {
        match ids.as_slice() {
            [a, b] => Participants::new(a, b),
            _ => Err(Error::validation(format!(
                "expected two participants, got {}",
                ids.len()
            ))),
        }
    }
}

impl From<Participants> for Vec<String> {
    fn from(p: Participants) -> Self {
        p.0.into()
    }
}

/// Conversation document as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub participants: Participants,
    #[serde(default)]
    pub pair_key: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub last_message_time: String,
}

impl ConversationRecord {
    pub fn new(participants: Participants, at: DateTime<Utc>) -> Self {
        let created = format_timestamp(at);
        Self {
            id: None,
            pair_key: participants.pair_key(),
            participants,
            created_at: created.clone(),
            last_message: String::new(),
            last_message_time: created,
        }
    }

    pub fn normalize(self) -> Option<Conversation> {
        let id = self.id.filter(|id| !id.is_empty())?;
        let Some(last_message_time) =
            parse_timestamp(&self.last_message_time).or_else(|| parse_timestamp(&self.created_at))
        else {
            log::warn!("dropping conversation {id}: no usable timestamp");
            return None;
        };
        Some(Conversation {
            id,
            participants: self.participants,
            last_message_preview: self.last_message,
            last_message_time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Participants,
    pub last_message_preview: String,
    pub last_message_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: UserId,
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
}
