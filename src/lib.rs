//! Real-time conversation sync and per-message translation for a two-party chat.
//!
//! The remote store, object storage, translation service and audio devices are
//! reached through traits ([`api::RemoteStore`], [`api::BlobStore`],
//! [`translation::TranslationBackend`], [`audio::Microphone`],
//! [`audio::AudioOutput`]); [`chat::ChatClient`] wires them to one session.

pub mod api;
pub mod app;
pub mod audio;
pub mod chat;
pub mod error;
pub mod feed;
pub mod index;
pub mod notify;
pub mod session;
pub mod storage;
pub mod translation;
pub mod utils;
pub mod view_model;

pub use chat::{ChatClient, MessagePoster, Services};
pub use error::{Error, Result};
pub use session::Session;
