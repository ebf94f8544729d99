use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use crate::api::BlobStore;
use crate::api::models::MessageId;
use crate::audio::LocalAudio;
use crate::error::{Error, Result};
use crate::notify::Notifications;

/// Independently playable audio source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotKey {
    Original(MessageId),
    Translation(MessageId),
    Draft,
}

/// A speaker. `play` returns when the clip ends or when `stop` fires
/// (a dropped sender counts as a stop).
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, clip: Arc<[u8]>, stop: oneshot::Receiver<()>) -> Result<()>;
}

/// Output that plays nothing for a fixed time. Used headless.
pub struct SilentOutput {
    length: Duration,
}

impl SilentOutput {
    pub fn new(length: Duration) -> Self {
        Self { length }
    }
}

#[async_trait]
impl AudioOutput for SilentOutput {
    async fn play(&self, _clip: Arc<[u8]>, stop: oneshot::Receiver<()>) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.length) => {}
            _ = stop => {}
        }
        Ok(())
    }
}

/// A slot's source. `stop` is taken once stop was requested; the entry stays
/// until the output has actually let go, so a replay waits on `done`.
struct Active {
    token: u64,
    stop: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Slots {
    next_token: u64,
    active: HashMap<SlotKey, Active>,
}

/// Single-flight play/stop per slot. The set of playing slots is published so a
/// view can render play/stop toggles without polling. A stopped slot leaves that
/// set at once, but its next source starts only after the old one has ended.
#[derive(Clone)]
pub struct PlaybackManager {
    output: Arc<dyn AudioOutput>,
    blobs: Arc<dyn BlobStore>,
    local: LocalAudio,
    notes: Notifications,
    slots: Arc<Mutex<Slots>>,
    playing: Arc<watch::Sender<BTreeSet<SlotKey>>>,
}

impl PlaybackManager {
    pub fn new(
        output: Arc<dyn AudioOutput>,
        blobs: Arc<dyn BlobStore>,
        local: LocalAudio,
        notes: Notifications,
    ) -> Self {
        let (playing, _) = watch::channel(BTreeSet::new());
        Self {
            output,
            blobs,
            local,
            notes,
            slots: Arc::new(Mutex::new(Slots::default())),
            playing: Arc::new(playing),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, slots: &Slots) {
        let next: BTreeSet<SlotKey> = slots
            .active
            .iter()
            .filter(|(_, a)| a.stop.is_some())
            .map(|(slot, _)| slot.clone())
            .collect();
        self.playing.send_if_modified(|playing| {
            if *playing == next {
                return false;
            }
            *playing = next;
            true
        });
    }

    /// Start playing `reference` on `slot`. A no-op while the slot is already playing.
    pub fn play(&self, reference: &str, slot: SlotKey) -> Result<()> {
        if reference.trim().is_empty() {
            return Err(Error::validation("nothing to play"));
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let (token, previous) = {
            let mut slots = self.lock();
            let previous = match slots.active.get(&slot) {
                Some(active) if active.stop.is_some() => {
                    log::debug!("{slot:?} already playing");
                    return Ok(());
                }
                Some(stopping) => Some(stopping.done.clone()),
                None => None,
            };
            slots.next_token += 1;
            let token = slots.next_token;
            slots.active.insert(
                slot.clone(),
                Active {
                    token,
                    stop: Some(stop_tx),
                    done: done_rx,
                },
            );
            self.publish(&slots);
            (token, previous)
        };
        log::debug!("play {slot:?} from {reference}");

        let this = self.clone();
        let reference = reference.to_string();
        tokio::spawn(async move {
            let clip = tokio::select! {
                clip = async {
                    if let Some(mut previous) = previous {
                        let _ = previous.wait_for(|done| *done).await;
                    }
                    this.resolve(&reference).await
                } => Some(clip),
                _ = &mut stop_rx => None,
            };
            let outcome = match clip {
                Some(Ok(clip)) => this.output.play(clip, stop_rx).await,
                Some(Err(e)) => Err(e),
                None => Ok(()),
            };
            if let Err(e) = outcome {
                this.notes.error("Playback failed", &e);
            }
            done_tx.send_replace(true);
            this.finished(&slot, token);
        });
        Ok(())
    }

    async fn resolve(&self, reference: &str) -> Result<Arc<[u8]>> {
        if LocalAudio::is_local(reference) {
            return self
                .local
                .resolve(reference)
                .ok_or_else(|| Error::validation(format!("{reference} is no longer available")));
        }
        Ok(self.blobs.fetch(reference).await?.into())
    }

    fn finished(&self, slot: &SlotKey, token: u64) {
        let mut slots = self.lock();
        if slots.active.get(slot).is_some_and(|a| a.token == token) {
            slots.active.remove(slot);
            self.publish(&slots);
            log::debug!("{slot:?} finished");
        }
    }

    /// Stop `slot`. Nothing happens when it is not playing.
    pub fn stop(&self, slot: &SlotKey) {
        let mut slots = self.lock();
        if let Some(stop) = slots.active.get_mut(slot).and_then(|a| a.stop.take()) {
            let _ = stop.send(());
            self.publish(&slots);
            log::debug!("stopping {slot:?}");
        }
    }

    pub fn stop_all(&self) {
        let mut slots = self.lock();
        for active in slots.active.values_mut() {
            if let Some(stop) = active.stop.take() {
                let _ = stop.send(());
            }
        }
        self.publish(&slots);
    }

    pub fn is_playing(&self, slot: &SlotKey) -> bool {
        self.playing.borrow().contains(slot)
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<SlotKey>> {
        self.playing.subscribe()
    }
}
