use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use lingo_bridge::api::BlobStore;
use lingo_bridge::api::memory::MemoryStore;
use lingo_bridge::api::models::{MessageRecord, UserProfile};
use lingo_bridge::audio::{
    CapturedAudio, CaptureState, Microphone, RecordingStream, SilentOutput, SlotKey,
};
use lingo_bridge::feed::FeedEvent;
use lingo_bridge::notify::{Notification, Notifications};
use lingo_bridge::translation::{TranslationBackend, TranslationOption, TranslationOutput, TranslationRequest};
use lingo_bridge::view_model::{RequestState, TranslationMode, ViewMessage};
use lingo_bridge::{ChatClient, Error, Result, Services, Session};

type Answer = Result<TranslationOutput>;

/// Answers are released by the test, one gate per target language.
#[derive(Default)]
struct ScriptedTranslator {
    gates: Mutex<HashMap<String, oneshot::Receiver<Answer>>>,
    options: Mutex<Vec<TranslationOption>>,
}

impl ScriptedTranslator {
    fn gate(&self, language: &str) -> oneshot::Sender<Answer> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(language.into(), rx);
        tx
    }
}

#[async_trait]
impl TranslationBackend for ScriptedTranslator {
    async fn translate(&self, request: TranslationRequest) -> Result<TranslationOutput> {
        self.options.lock().unwrap().push(request.option);
        let gate = self.gates.lock().unwrap().remove(&request.language);
        match gate {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::transport("gate dropped"))),
            None => Err(Error::transport("HTTP 500 Internal Server Error")),
        }
    }
}

struct ToneMic;

struct ToneStream;

impl Microphone for ToneMic {
    fn open(&self) -> Result<Box<dyn RecordingStream>> {
        Ok(Box::new(ToneStream))
    }
}

impl RecordingStream for ToneStream {
    fn finish(self: Box<Self>) -> Result<CapturedAudio> {
        Ok(CapturedAudio {
            samples: (0..1600).map(|i| ((i % 40) * 500) as i16).collect(),
            sample_rate: 16_000,
            channels: 1,
        })
    }
}

/// Blob store whose next upload waits for the test to pass or fail it.
struct HeldUploads {
    store: MemoryStore,
    gate: Mutex<Option<oneshot::Receiver<bool>>>,
}

impl HeldUploads {
    fn new(store: &MemoryStore) -> Self {
        Self {
            store: store.clone(),
            gate: Mutex::new(None),
        }
    }

    fn hold_next(&self) -> oneshot::Sender<bool> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl BlobStore for HeldUploads {
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

fn profile(uid: &str, name: &str) -> UserProfile {
    UserProfile {
        uid: uid.into(),
        display_name: name.into(),
        email: format!("{uid}@example.org"),
        photo_url: None,
    }
}

struct Harness {
    store: MemoryStore,
    translator: Arc<ScriptedTranslator>,
    client: ChatClient,
    notes: mpsc::UnboundedReceiver<Notification>,
}

fn harness(uid: &str) -> Harness {
    harness_on(MemoryStore::new(), uid)
}

fn harness_on(store: MemoryStore, uid: &str) -> Harness {
    let blobs = Arc::new(store.clone());
    harness_with(store, blobs, uid)
}

fn harness_with(store: MemoryStore, blobs: Arc<dyn BlobStore>, uid: &str) -> Harness {
    store.add_user(profile("alice", "Alice"));
    store.add_user(profile("bob", "Bob"));
    let translator = Arc::new(ScriptedTranslator::default());
    let (notify, notes) = Notifications::channel();
    let client = ChatClient::new(
        Session::new(profile(uid, uid), None),
        Services {
            store: Arc::new(store.clone()),
            blobs,
            translator: translator.clone(),
            microphone: Arc::new(ToneMic),
            output: Arc::new(SilentOutput::new(Duration::from_secs(30))),
            cache: None,
        },
        notify,
    );
    Harness {
        store,
        translator,
        client,
        notes,
    }
}

async fn wait_for(client: &ChatClient, pred: impl Fn(&[ViewMessage]) -> bool) -> Arc<[ViewMessage]> {
    let mut rx = client.messages();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if pred(&snapshot[..]) {
                return snapshot;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("view never reached the expected state")
}

/// Opens a chat with bob and waits until bob's message `text` is on screen.
async fn incoming_text(h: &Harness, text: &str) -> String {
    let conversation = h.client.start_chat("bob").await.unwrap();
    h.client.open_conversation(&conversation.id).unwrap();
    h.store.insert_message(MessageRecord::new_text(
        &conversation.id,
        "bob",
        text,
        chrono::Utc::now(),
    ));
    let view = wait_for(&h.client, |v| v.iter().any(|m| m.message.sender_id == "bob")).await;
    view.iter()
        .find(|m| m.message.sender_id == "bob")
        .map(|m| m.message.id.clone())
        .unwrap()
}

#[tokio::test]
async fn hola_is_translated_to_hello() {
    let mut h = harness("alice");
    let id = incoming_text(&h, "Hola").await;
    let answer = h.translator.gate("en");

    let done = h.client.translate(&id, TranslationMode::ToText, "en").unwrap();
    let pending = h.client.snapshot();
    assert_eq!(pending[0].overlay.as_ref().unwrap().request_state, RequestState::Pending);

    answer.send(Ok(TranslationOutput::Text("Hello".into()))).unwrap();
    done.await.unwrap();
    let overlay = h.client.snapshot()[0].overlay.clone().unwrap();
    assert_eq!(overlay.request_state, RequestState::Succeeded);
    assert_eq!(overlay.result_text.as_deref(), Some("Hello"));
    assert!(h.notes.try_recv().is_err());
}

#[tokio::test]
async fn server_error_marks_failed_and_notifies() {
    let mut h = harness("alice");
    let id = incoming_text(&h, "Hola").await;
    h.client
        .translate(&id, TranslationMode::ToText, "en")
        .unwrap()
        .await
        .unwrap();
    let overlay = h.client.snapshot()[0].overlay.clone().unwrap();
    assert_eq!(overlay.request_state, RequestState::Failed);
    assert_eq!(overlay.result_text, None);
    assert_eq!(overlay.result_audio_ref, None);
    assert_eq!(h.notes.try_recv().unwrap().title, "Translation failed");
}

#[tokio::test]
async fn recorded_voice_message_translates_to_speech_and_plays() {
    let bob = harness("bob");
    let alice = harness_on(bob.store.clone(), "alice");

    let conversation = bob.client.start_chat("alice").await.unwrap();
    bob.client.open_conversation(&conversation.id).unwrap();
    bob.client.start_recording().unwrap();
    bob.client.stop_recording().unwrap();
    bob.client.play_draft().unwrap();
    assert!(bob.client.playback().is_playing(&SlotKey::Draft));
    bob.client.send_recording().await.unwrap();
    assert_eq!(bob.client.audio().state(), CaptureState::Idle);
    assert!(!bob.client.playback().is_playing(&SlotKey::Draft));

    alice.client.open_conversation(&conversation.id).unwrap();
    let view = wait_for(&alice.client, |v| v.iter().any(|m| m.message.is_audio())).await;
    let id = view[0].message.id.clone();

    alice
        .translator
        .gate("ja")
        .send(Ok(TranslationOutput::Audio(vec![0x4f, 0x67, 0x67, 0x53])))
        .unwrap();
    alice
        .client
        .translate(&id, TranslationMode::ToSpeech, "ja")
        .unwrap()
        .await
        .unwrap();
    let overlay = alice.client.snapshot()[0].overlay.clone().unwrap();
    assert_eq!(overlay.request_state, RequestState::Succeeded);
    assert!(overlay.result_audio_ref.unwrap().starts_with("local:"));
    assert_eq!(
        alice.translator.options.lock().unwrap().as_slice(),
        [TranslationOption::SpeechToSpeech]
    );

    alice.client.play_translation(&id).unwrap();
    alice.client.play_translation(&id).unwrap();
    alice.client.play_original(&id).unwrap();
    let playback = alice.client.playback();
    assert!(playback.is_playing(&SlotKey::Translation(id.clone())));
    assert!(playback.is_playing(&SlotKey::Original(id.clone())));
    alice.client.stop(&SlotKey::Translation(id.clone()));
    alice.client.stop(&SlotKey::Translation(id.clone()));
    assert!(!playback.is_playing(&SlotKey::Translation(id.clone())));
    assert!(playback.is_playing(&SlotKey::Original(id)));
}

#[tokio::test]
async fn newest_request_wins_even_when_it_answers_first() {
    let h = harness("alice");
    let id = incoming_text(&h, "Buongiorno").await;
    let first = h.translator.gate("es");
    let second = h.translator.gate("en");

    let r1 = h.client.translate(&id, TranslationMode::ToText, "es").unwrap();
    let r2 = h.client.translate(&id, TranslationMode::ToText, "en").unwrap();
    second.send(Ok(TranslationOutput::Text("Good morning".into()))).unwrap();
    r2.await.unwrap();
    first.send(Ok(TranslationOutput::Text("Buenos días".into()))).unwrap();
    r1.await.unwrap();

    let overlay = h.client.snapshot()[0].overlay.clone().unwrap();
    assert_eq!(overlay.target_language, "en");
    assert_eq!(overlay.result_text.as_deref(), Some("Good morning"));
}

#[tokio::test]
async fn switching_conversation_drops_overlays_and_late_results() {
    let h = harness("alice");
    let id = incoming_text(&h, "Hola").await;
    let answer = h.translator.gate("hi");
    let pending = h.client.translate(&id, TranslationMode::ToSpeech, "hi").unwrap();

    let other = h.client.start_chat("carol").await.unwrap();
    h.client.open_conversation(&other.id).unwrap();
    answer.send(Ok(TranslationOutput::Audio(vec![1, 2, 3]))).unwrap();
    pending.await.unwrap();

    let view = wait_for(&h.client, |_| true).await;
    assert!(view.iter().all(|m| m.overlay.is_none()));
    assert!(view.iter().all(|m| m.message.conversation_id == other.id));
    assert!(h.client.play_translation(&id).is_err());
}

#[tokio::test]
async fn leaving_a_conversation_mid_upload_drops_the_voice_draft() {
    let store = MemoryStore::new();
    let uploads = Arc::new(HeldUploads::new(&store));
    let h = harness_with(store.clone(), uploads.clone(), "alice");
    let first = h.client.start_chat("bob").await.unwrap();
    let second = h.client.start_chat("carol").await.unwrap();
    h.client.open_conversation(&first.id).unwrap();
    h.client.start_recording().unwrap();
    h.client.stop_recording().unwrap();

    let fail_upload = uploads.hold_next();
    let mut capture = h.client.audio().subscribe();
    let (sent, ()) = tokio::join!(h.client.send_recording(), async {
        capture.wait_for(|s| *s == CaptureState::Uploading).await.unwrap();
        h.client.open_conversation(&second.id).unwrap();
        fail_upload.send(false).unwrap();
    });

    assert!(sent.is_err());
    assert_eq!(h.client.audio().state(), CaptureState::Idle);
    assert!(h.client.audio().draft().is_none());
    assert!(matches!(h.client.play_draft(), Err(Error::Validation(_))));
    assert!(matches!(h.client.send_recording().await, Err(Error::Validation(_))));
    assert!(store.messages(&first.id).is_empty());
    assert!(store.messages(&second.id).is_empty());
}

#[tokio::test]
async fn concurrent_start_chat_keeps_the_pair_invariant() {
    let store = MemoryStore::new();
    let alice = harness_on(store.clone(), "alice");
    let bob = harness_on(store.clone(), "bob");
    let (a, b) = tokio::join!(alice.client.start_chat("bob"), bob.client.start_chat("alice"));
    let (a, b) = (a.unwrap(), b.unwrap());
    for conversation in [&a, &b] {
        assert!(conversation.participants.contains("alice"));
        assert!(conversation.participants.contains("bob"));
    }
    assert_eq!(a.id, b.id);
    assert_eq!(store.conversations().len(), 1);
}

#[tokio::test]
async fn conversation_list_follows_sends_and_stops_on_shutdown() {
    let h = harness("alice");
    let mut list = h.client.conversations();
    assert!(matches!(list.next().await, Some(FeedEvent::Snapshot(l)) if l.is_empty()));

    let conversation = h.client.start_chat("bob").await.unwrap();
    h.client.open_conversation(&conversation.id).unwrap();
    h.client.send_text("see you at 8").await.unwrap();

    let latest = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(FeedEvent::Snapshot(l)) = list.next().await {
                if l.first().is_some_and(|s| s.preview() == "see you at 8") {
                    return l;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(latest[0].participant.display_name(), "Bob");

    assert!(matches!(h.client.send_text("  ").await, Err(Error::Validation(_))));
    h.client.shutdown();
    assert_eq!(list.next().await, None);
    assert!(h.client.active_conversation().is_none());
    assert!(h.client.snapshot().is_empty());
    tokio::task::yield_now().await;
    assert_eq!(h.store.message_watcher_count(), 0);
}
