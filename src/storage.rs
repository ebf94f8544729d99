use chrono::DateTime;
use directories::ProjectDirs;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};

use crate::api::models::{Conversation, Participants, UserProfile};
use crate::error::Result;
use crate::index::{ConversationSummary, Participant};

/// Where the cache lives when none is configured.
pub fn default_location() -> Option<PathBuf> {
    let proj = ProjectDirs::from("org", "lingo-bridge", "LingoBridge")?;
    Some(proj.data_dir().join("cache.sqlite"))
}

// Last known conversation list, shown before the first snapshot arrives.
// Advisory only: the remote feed always wins.
#[derive(Debug, Clone)]
pub struct ConversationCache {
    path: PathBuf,
}

type CachedRow = (String, String, String, String, Option<String>, Option<String>, Option<String>, String, i64);

impl ConversationCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let cache = Self { path: path.to_path_buf() };
        cache.open_conn()?.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_a TEXT NOT NULL,
                participant_b TEXT NOT NULL,
                other_uid TEXT NOT NULL,
                other_name TEXT,
                other_email TEXT,
                other_photo TEXT,
                preview TEXT NOT NULL,
                last_message_time INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_conn(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.path)
    }

    /// Replace the stored list with `summaries`.
    pub fn replace(&self, summaries: &[ConversationSummary]) -> Result<()> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM conversations", [])?;
        for s in summaries {
            let [a, b] = s.conversation.participants.ids();
            let (name, email, photo) = match &s.participant {
                Participant::Known(user) => (
                    Some(user.display_name.as_str()),
                    Some(user.email.as_str()),
                    user.photo_url.as_deref(),
                ),
                Participant::Unknown(_) => (None, None, None),
            };
            tx.execute(
                r#"
                INSERT INTO conversations
                    (id, participant_a, participant_b, other_uid, other_name, other_email,
                     other_photo, preview, last_message_time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    preview = excluded.preview,
                    last_message_time = excluded.last_message_time
                "#,
                params![
                    s.conversation.id,
                    a,
                    b,
                    s.participant.uid(),
                    name,
                    email,
                    photo,
                    s.conversation.last_message_preview,
                    s.conversation.last_message_time.timestamp_millis(),
                ],
            )?;
        }
        tx.commit()?;
        log::debug!("cached {} conversations", summaries.len());
        Ok(())
    }

    /// Most recent first.
    pub fn cached(&self, limit: Option<usize>) -> Result<Vec<ConversationSummary>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, participant_a, participant_b, other_uid, other_name, other_email, other_photo,
                    preview, last_message_time
             FROM conversations ORDER BY last_message_time DESC, id ASC LIMIT ?1",
        )?;
        let lim = limit.map_or(-1, |l| l as i64);
        let rows = stmt.query_map(params![lim], |row| -> rusqlite::Result<CachedRow> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            match summary_from_row(r?) {
                Some(summary) => out.push(summary),
                None => log::warn!("skipping unreadable cached conversation"),
            }
        }
        Ok(out)
    }
}

fn summary_from_row(row: CachedRow) -> Option<ConversationSummary> {
    let (id, a, b, other_uid, name, email, photo, preview, millis) = row;
    let participants = Participants::new(&a, &b).ok()?;
    let participant = match name {
        Some(display_name) => Participant::Known(UserProfile {
            uid: other_uid,
            display_name,
            email: email.unwrap_or_default(),
            photo_url: photo,
        }),
        None => Participant::Unknown(other_uid),
    };
    Some(ConversationSummary {
        conversation: Conversation {
            id,
            participants,
            last_message_preview: preview,
            last_message_time: DateTime::from_timestamp_millis(millis)?,
        },
        participant,
    })
}
