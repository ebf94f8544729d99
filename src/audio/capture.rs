//! Microphone capture and the send path of a recorded voice message.
//!
//! `Idle -> Recording -> Captured -> Uploading -> Uploaded`, with `Captured`
//! retained (and an error attached) when the upload or the append fails, and
//! `discard` returning to `Idle` from any settled state. A send that was
//! abandoned mid-upload settles in `Idle` whatever its outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::api::BlobStore;
use crate::api::models::{ConversationId, MessageId, Payload};
use crate::audio::{LocalAudio, wav};
use crate::chat::MessagePoster;
use crate::error::{Error, Result};
use crate::notify::Notifications;

/// Raw PCM handed back by a finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

pub trait Microphone: Send + Sync {
    /// Acquire the device and start recording.
    fn open(&self) -> Result<Box<dyn RecordingStream>>;
}

/// A running recording. Finishing or dropping it releases the device.
pub trait RecordingStream: Send {
    fn finish(self: Box<Self>) -> Result<CapturedAudio>;
}

/// Stand-in for hosts without an input device.
pub struct NoMicrophone;

impl Microphone for NoMicrophone {
    fn open(&self) -> Result<Box<dyn RecordingStream>> {
        Err(Error::device("no microphone available"))
    }
}

/// Lets one recording at a time hold the wrapped device, across pipelines.
pub struct ExclusiveMicrophone {
    device: Arc<dyn Microphone>,
    busy: Arc<AtomicBool>,
}

impl ExclusiveMicrophone {
    pub fn new(device: Arc<dyn Microphone>) -> Self {
        Self {
            device,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct ExclusiveStream {
    inner: Option<Box<dyn RecordingStream>>,
    busy: Arc<AtomicBool>,
}

impl RecordingStream for ExclusiveStream {
    fn finish(mut self: Box<Self>) -> Result<CapturedAudio> {
        match self.inner.take() {
            Some(stream) => stream.finish(),
            None => Err(Error::device("recording already finished")),
        }
    }
}

impl Drop for ExclusiveStream {
    fn drop(&mut self) {
        self.inner.take();
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl Microphone for ExclusiveMicrophone {
    fn open(&self) -> Result<Box<dyn RecordingStream>> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(Error::device("microphone is in use"));
        }
        match self.device.open() {
            Ok(stream) => Ok(Box::new(ExclusiveStream {
                inner: Some(stream),
                busy: self.busy.clone(),
            })),
            Err(e) => {
                self.busy.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Captured { error: Option<String> },
    Uploading,
    Uploaded(String),
}

#[derive(Clone)]
struct Artifact {
    wav: Arc<[u8]>,
    handle: String,
}

enum Phase {
    Idle,
    Recording(Box<dyn RecordingStream>),
    Captured { artifact: Artifact, error: Option<String> },
    Uploading { artifact: Artifact, abandoned: bool },
}

impl Phase {
    fn state(&self) -> CaptureState {
        match self {
            Phase::Idle => CaptureState::Idle,
            Phase::Recording(_) => CaptureState::Recording,
            Phase::Captured { error, .. } => CaptureState::Captured { error: error.clone() },
            Phase::Uploading { .. } => CaptureState::Uploading,
        }
    }
}

pub struct AudioPipeline {
    mic: Arc<dyn Microphone>,
    blobs: Arc<dyn BlobStore>,
    poster: MessagePoster,
    local: LocalAudio,
    notes: Notifications,
    phase: Mutex<Phase>,
    state: watch::Sender<CaptureState>,
}

impl AudioPipeline {
    pub fn new(
        mic: Arc<dyn Microphone>,
        blobs: Arc<dyn BlobStore>,
        poster: MessagePoster,
        local: LocalAudio,
        notes: Notifications,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        Self {
            mic,
            blobs,
            poster,
            local,
            notes,
            phase: Mutex::new(Phase::Idle),
            state,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set(&self, phase: &mut Phase, next: Phase) {
        *phase = next;
        let state = phase.state();
        log::debug!("capture -> {state:?}");
        self.state.send_replace(state);
    }

    pub fn start(&self) -> Result<()> {
        let mut phase = self.lock();
        match &*phase {
            Phase::Idle => {}
            Phase::Recording(_) => return Err(Error::validation("already recording")),
            Phase::Captured { .. } => {
                return Err(Error::validation("send or discard the current recording first"));
            }
            Phase::Uploading { .. } => return Err(Error::validation("a recording is being sent")),
        }
        match self.mic.open() {
            Ok(stream) => {
                self.set(&mut phase, Phase::Recording(stream));
                Ok(())
            }
            Err(e) => {
                self.notes.error("Microphone access denied", &e);
                Err(e)
            }
        }
    }

    /// Stop recording and keep the result as a draft. Returns the draft's local
    /// handle, playable under [`crate::audio::SlotKey::Draft`].
    pub fn stop(&self) -> Result<String> {
        let mut phase = self.lock();
        let stream = match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Recording(stream) => stream,
            other => {
                *phase = other;
                return Err(Error::validation("not recording"));
            }
        };
        let captured = stream.finish();
        let encoded = captured.and_then(|audio| {
            if audio.samples.is_empty() {
                return Err(Error::validation("recording is empty"));
            }
            wav::encode(&audio.samples, audio.sample_rate, audio.channels)
        });
        match encoded {
            Ok(bytes) => {
                let wav: Arc<[u8]> = bytes.into();
                let handle = self.local.register(wav.clone());
                self.set(&mut phase, Phase::Captured {
                    artifact: Artifact { wav, handle: handle.clone() },
                    error: None,
                });
                Ok(handle)
            }
            Err(e) => {
                self.set(&mut phase, Phase::Idle);
                if matches!(e, Error::Device(_)) {
                    self.notes.error("Recording failed", &e);
                }
                Err(e)
            }
        }
    }

    /// Drop the current recording or draft. Idle stays idle.
    pub fn discard(&self) -> Result<()> {
        let mut phase = self.lock();
        if matches!(&*phase, Phase::Uploading { .. }) {
            return Err(Error::validation("a recording is being sent"));
        }
        self.release(&mut phase);
        Ok(())
    }

    /// Let go of everything tied to the conversation being left. A recording in
    /// flight finishes its upload, but no longer comes back as a draft if it fails.
    pub fn abandon(&self) {
        let mut phase = self.lock();
        if let Phase::Uploading { abandoned, .. } = &mut *phase {
            *abandoned = true;
            log::debug!("recording in flight abandoned");
            return;
        }
        self.release(&mut phase);
    }

    fn release(&self, phase: &mut Phase) {
        match std::mem::replace(phase, Phase::Idle) {
            Phase::Idle => return,
            Phase::Recording(stream) => {
                if let Err(e) = stream.finish() {
                    log::debug!("discarded recording ended with {e}");
                }
            }
            Phase::Captured { artifact, .. } | Phase::Uploading { artifact, .. } => {
                self.local.revoke(&artifact.handle)
            }
        }
        self.set(phase, Phase::Idle);
    }

    /// Upload the draft and append it to `conversation_id`. On failure the draft
    /// is kept so the user can retry or discard.
    pub async fn send(&self, conversation_id: &ConversationId) -> Result<MessageId> {
        let artifact = {
            let mut phase = self.lock();
            let artifact = match &*phase {
                Phase::Captured { artifact, .. } => artifact.clone(),
                _ => return Err(Error::validation("no recording to send")),
            };
            self.set(&mut phase, Phase::Uploading {
                artifact: artifact.clone(),
                abandoned: false,
            });
            artifact
        };

        match self.upload_and_append(conversation_id, &artifact).await {
            Ok(id) => {
                self.local.revoke(&artifact.handle);
                let mut phase = self.lock();
                self.set(&mut phase, Phase::Idle);
                Ok(id)
            }
            Err(e) => {
                self.notes.error("Failed to send audio", &e);
                let mut phase = self.lock();
                if matches!(&*phase, Phase::Uploading { abandoned: true, .. }) {
                    self.local.revoke(&artifact.handle);
                    self.set(&mut phase, Phase::Idle);
                } else {
                    self.set(&mut phase, Phase::Captured {
                        artifact,
                        error: Some(e.to_string()),
                    });
                }
                Err(e)
            }
        }
    }

    async fn upload_and_append(&self, conversation_id: &ConversationId, artifact: &Artifact) -> Result<MessageId> {
        let reference = self.blobs.store(artifact.wav.to_vec(), wav::CONTENT_TYPE).await?;
        self.state.send_replace(CaptureState::Uploaded(reference.clone()));
        log::debug!("recording stored at {reference}");
        self.poster.send(conversation_id, Payload::Audio(reference)).await
    }

    pub fn state(&self) -> CaptureState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    /// Local handle of the captured, unsent recording.
    pub fn draft(&self) -> Option<String> {
        match &*self.lock() {
            Phase::Captured { artifact, .. }
            | Phase::Uploading {
                artifact,
                abandoned: false,
            } => Some(artifact.handle.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteStore;
    use crate::api::memory::MemoryStore;
    use crate::api::models::UserProfile;
    use crate::session::Session;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    /// Holds the first upload until the test decides how it ends.
    struct HeldUpload {
        store: MemoryStore,
        gate: Mutex<Option<oneshot::Receiver<bool>>>,
    }

    #[async_trait]
    impl BlobStore for HeldUpload {
        async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String> {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                if !gate.await.unwrap_or(false) {
                    return Err(Error::transport("HTTP 503 Service Unavailable"));
                }
            }
            self.store.store(bytes, content_type).await
        }

        async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
            self.store.fetch(reference).await
        }
    }

    #[derive(Default)]
    struct FakeMic {
        open: Arc<AtomicUsize>,
    }

    struct FakeStream {
        open: Arc<AtomicUsize>,
    }

    impl Microphone for FakeMic {
        fn open(&self) -> Result<Box<dyn RecordingStream>> {
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeStream { open: self.open.clone() }))
        }
    }

    impl RecordingStream for FakeStream {
        fn finish(self: Box<Self>) -> Result<CapturedAudio> {
            Ok(CapturedAudio {
                samples: vec![100; 800],
                sample_rate: 8_000,
                channels: 1,
            })
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn pipeline(store: &MemoryStore, mic: Arc<dyn Microphone>) -> (AudioPipeline, LocalAudio) {
        pipeline_with(store, Arc::new(store.clone()), mic)
    }

    fn pipeline_with(
        store: &MemoryStore,
        blobs: Arc<dyn BlobStore>,
        mic: Arc<dyn Microphone>,
    ) -> (AudioPipeline, LocalAudio) {
        let session = Session::new(
            UserProfile {
                uid: "alice".into(),
                display_name: "Alice".into(),
                email: String::new(),
                photo_url: None,
            },
            None,
        );
        let local = LocalAudio::new();
        let poster = MessagePoster::new(Arc::new(store.clone()), session, Notifications::disabled());
        let pipeline = AudioPipeline::new(
            mic,
            blobs,
            poster,
            local.clone(),
            Notifications::disabled(),
        );
        (pipeline, local)
    }

    #[test]
    fn device_is_held_only_while_recording() {
        let mic = Arc::new(FakeMic::default());
        let (p, local) = pipeline(&MemoryStore::new(), mic.clone());
        p.start().unwrap();
        assert_eq!(mic.open.load(Ordering::SeqCst), 1);
        assert!(matches!(p.start(), Err(Error::Validation(_))));
        let handle = p.stop().unwrap();
        assert_eq!(mic.open.load(Ordering::SeqCst), 0);
        assert_eq!(p.state(), CaptureState::Captured { error: None });
        assert!(local.resolve(&handle).is_some());
        p.discard().unwrap();
        assert_eq!(p.state(), CaptureState::Idle);
        assert!(local.resolve(&handle).is_none());
    }

    #[test]
    fn denied_microphone_stays_idle() {
        let (notes, mut rx) = Notifications::channel();
        let store = MemoryStore::new();
        let (mut p, _) = pipeline(&store, Arc::new(NoMicrophone));
        p.notes = notes;
        assert!(matches!(p.start(), Err(Error::Device(_))));
        assert_eq!(p.state(), CaptureState::Idle);
        assert_eq!(rx.try_recv().unwrap().title, "Microphone access denied");
    }

    #[test]
    fn exclusive_microphone_refuses_a_second_owner() {
        let shared: Arc<dyn Microphone> = Arc::new(ExclusiveMicrophone::new(Arc::new(FakeMic::default())));
        let store = MemoryStore::new();
        let (a, _) = pipeline(&store, shared.clone());
        let (b, _) = pipeline(&store, shared);
        a.start().unwrap();
        assert!(matches!(b.start(), Err(Error::Device(_))));
        a.discard().unwrap();
        b.start().unwrap();
    }

    #[tokio::test]
    async fn failed_upload_keeps_the_draft_for_retry() {
        let store = MemoryStore::new();
        let (p, _) = pipeline(&store, Arc::new(FakeMic::default()));
        p.start().unwrap();
        p.stop().unwrap();

        store.fail_next_uploads(1);
        assert!(p.send(&"c1".into()).await.is_err());
        assert!(matches!(p.state(), CaptureState::Captured { error: Some(_) }));
        assert!(p.draft().is_some());
        assert!(store.messages("c1").is_empty());

        let id = p.send(&"c1".into()).await.unwrap();
        assert_eq!(p.state(), CaptureState::Idle);
        assert!(p.draft().is_none());
        let sent = store.messages("c1");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id.as_deref(), Some(id.as_str()));
        let url = sent[0].audio_url.clone().unwrap();
        let bytes = store.fetch(&url).await.unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
    }

    #[tokio::test]
    async fn send_without_recording_is_rejected_before_io() {
        let store = MemoryStore::new();
        let (p, _) = pipeline(&store, Arc::new(FakeMic::default()));
        assert!(matches!(p.send(&"c1".into()).await, Err(Error::Validation(_))));
        assert_eq!(store.blob_count(), 0);
        assert!(store.find_conversation("alice", "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abandoned_upload_failure_does_not_resurrect_the_draft() {
        let store = MemoryStore::new();
        let (release, gate) = oneshot::channel();
        let blobs = Arc::new(HeldUpload {
            store: store.clone(),
            gate: Mutex::new(Some(gate)),
        });
        let (p, local) = pipeline_with(&store, blobs, Arc::new(FakeMic::default()));
        let p = Arc::new(p);
        p.start().unwrap();
        let handle = p.stop().unwrap();

        let mut state = p.subscribe();
        let sending = tokio::spawn({
            let p = p.clone();
            async move { p.send(&"c1".into()).await }
        });
        state.wait_for(|s| *s == CaptureState::Uploading).await.unwrap();
        assert!(matches!(p.discard(), Err(Error::Validation(_))));

        p.abandon();
        local.clear();
        assert!(p.draft().is_none());
        release.send(false).unwrap();

        assert!(sending.await.unwrap().is_err());
        assert_eq!(p.state(), CaptureState::Idle);
        assert!(p.draft().is_none());
        assert!(local.resolve(&handle).is_none());
        assert!(store.messages("c1").is_empty());
        p.start().unwrap();
    }

    #[tokio::test]
    async fn abandoned_upload_that_succeeds_still_posts_to_its_conversation() {
        let store = MemoryStore::new();
        let (release, gate) = oneshot::channel();
        let blobs = Arc::new(HeldUpload {
            store: store.clone(),
            gate: Mutex::new(Some(gate)),
        });
        let (p, _) = pipeline_with(&store, blobs, Arc::new(FakeMic::default()));
        let p = Arc::new(p);
        p.start().unwrap();
        p.stop().unwrap();

        let mut state = p.subscribe();
        let sending = tokio::spawn({
            let p = p.clone();
            async move { p.send(&"c1".into()).await }
        });
        state.wait_for(|s| *s == CaptureState::Uploading).await.unwrap();
        p.abandon();
        release.send(true).unwrap();

        sending.await.unwrap().unwrap();
        assert_eq!(p.state(), CaptureState::Idle);
        assert_eq!(store.messages("c1").len(), 1);
    }
}
