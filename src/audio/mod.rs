//! Audio capture, encoding, local handles and playback.

pub mod capture;
#[cfg(feature = "device-audio")]
pub mod device;
pub mod playback;
pub mod wav;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub use capture::{AudioPipeline, CaptureState, CapturedAudio, Microphone, NoMicrophone, RecordingStream};
pub use playback::{AudioOutput, PlaybackManager, SilentOutput, SlotKey};

const LOCAL_PREFIX: &str = "local:";

/// Registry of audio that only exists on this client: translated speech and
/// draft recordings. Handles look like `local:<uuid>`.
#[derive(Clone, Default)]
pub struct LocalAudio {
    clips: Arc<Mutex<HashMap<String, Arc<[u8]>>>>,
}

impl LocalAudio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<[u8]>>> {
        match self.clips.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_local(reference: &str) -> bool {
        reference.starts_with(LOCAL_PREFIX)
    }

    pub fn register(&self, bytes: impl Into<Arc<[u8]>>) -> String {
        let handle = format!("{LOCAL_PREFIX}{}", uuid::Uuid::new_v4());
        self.lock().insert(handle.clone(), bytes.into());
        handle
    }

    pub fn resolve(&self, handle: &str) -> Option<Arc<[u8]>> {
        self.lock().get(handle).cloned()
    }

    pub fn revoke(&self, handle: &str) {
        if self.lock().remove(handle).is_some() {
            log::debug!("revoked {handle}");
        }
    }

    pub fn clear(&self) {
        let mut clips = self.lock();
        if !clips.is_empty() {
            log::debug!("dropping {} local clips", clips.len());
            clips.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
