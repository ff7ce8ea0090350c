//! The dialogue coordinator: session state machine over all components.
//!
//! One actor owns the high-level session state and routes messages among
//! the children. The session walks
//! **ready → asleep → awake → decoding → recognizing → handling → ready**,
//! with a separate **training_sentences → training_speech →
//! training_intent** track that pauses wake listening and, on success,
//! replaces the wake detector, decoder and recognizer with fresh instances
//! so retrained artifacts are loaded.
//!
//! Out-of-band requests (transcribe a supplied WAV, recognize supplied
//! text, play a spoken sentence's WAV, look up pronunciations) are
//! honoured in any state by forwarding directly to the relevant child;
//! they never disturb the session state.

use crate::audio::player::{self, SoundPlayerHandle};
use crate::audio::source::{self, AudioSourceHandle};
use crate::config::Profile;
use crate::decode::{self, DecoderHandle};
use crate::error::{AssistantError, Result};
use crate::handle::{self, HandlerHandle};
use crate::listener::{self, CommandListenerHandle};
use crate::pipeline::messages::{IntentResult, Transcription, VoiceCommand};
use crate::pronounce::{self, PronounceHandle, WordPronunciation};
use crate::recognize::{self, RecognizerHandle, RecognizerPaths};
use crate::train::{Trainer, TrainingPhase, TrainingReport};
use crate::wake::{self, WakeEvent, WakeHandle};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// High-level session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Children spawned, problems being collected.
    Loading,
    /// Baseline; nothing in flight.
    Ready,
    /// Wake detector is listening.
    Asleep,
    /// Command listener is recording.
    Awake,
    /// Waiting on the speech decoder.
    Decoding,
    /// Waiting on the intent recognizer.
    Recognizing,
    /// Waiting on the intent handler.
    Handling,
    /// Training: grammars and intent FST.
    TrainingSentences,
    /// Training: vocabulary, dictionary, language model.
    TrainingSpeech,
    /// Training: intent-recognizer artifacts.
    TrainingIntent,
}

impl SessionState {
    /// Whether this is one of the training states.
    pub fn is_training(self) -> bool {
        matches!(
            self,
            Self::TrainingSentences | Self::TrainingSpeech | Self::TrainingIntent
        )
    }

    /// Whether a voice session is mid-flight.
    fn in_session(self) -> bool {
        matches!(
            self,
            Self::Awake | Self::Decoding | Self::Recognizing | Self::Handling
        )
    }
}

/// Per-component configuration problems collected at load time.
pub type ProblemMap = HashMap<String, HashMap<String, String>>;

enum DialogueMsg {
    Request(Request),
    Event(Event),
}

enum Request {
    ListenForWake {
        reply: oneshot::Sender<Result<()>>,
    },
    ListenForCommand {
        handle: bool,
        timeout_sec: Option<f32>,
        reply: oneshot::Sender<IntentResult>,
    },
    TranscribeWav {
        wav: Vec<u8>,
        reply: oneshot::Sender<Result<Transcription>>,
    },
    RecognizeText {
        text: String,
        reply: oneshot::Sender<Result<IntentResult>>,
    },
    HandleIntent {
        intent: IntentResult,
        reply: oneshot::Sender<Result<IntentResult>>,
    },
    PlayWav {
        wav: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    GetPronunciations {
        words: Vec<String>,
        n: usize,
        reply: oneshot::Sender<Result<BTreeMap<String, WordPronunciation>>>,
    },
    Train {
        reload: bool,
        reply: oneshot::Sender<Result<TrainingReport>>,
    },
    GetState {
        reply: oneshot::Sender<(SessionState, ProblemMap)>,
    },
    GetAudioSource {
        reply: oneshot::Sender<AudioSourceHandle>,
    },
    Shutdown,
}

enum Event {
    WakeDetected { keyphrase: String },
    CommandCaptured(Result<VoiceCommand>),
    Transcribed(Transcription),
    Recognized(IntentResult),
    Handled(IntentResult),
    TrainingPhase(TrainingPhase),
    TrainingFinished(Box<Result<TrainingReport>>),
}

/// Handle to the dialogue coordinator.
#[derive(Clone)]
pub struct DialogueHandle {
    tx: mpsc::Sender<DialogueMsg>,
}

macro_rules! request {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply, rx) = oneshot::channel();
        $self
            .tx
            .send(DialogueMsg::Request(Request::$variant { $($field: $value,)* reply }))
            .await
            .map_err(|_| AssistantError::Channel("dialogue stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("dialogue stopped".into()))
    }};
}

impl DialogueHandle {
    /// Start listening for the wake word (ready → asleep).
    ///
    /// # Errors
    ///
    /// Returns an error while training is in progress or a session is
    /// mid-flight.
    pub async fn listen_for_wake(&self) -> Result<()> {
        request!(self, ListenForWake {})?
    }

    /// Record one voice command now (skipping wake) and return its intent.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the coordinator has stopped.
    pub async fn listen_for_command(
        &self,
        handle: bool,
        timeout_sec: Option<f32>,
    ) -> Result<IntentResult> {
        request!(self, ListenForCommand { handle: handle, timeout_sec: timeout_sec })
    }

    /// Out-of-band: transcribe a supplied WAV buffer.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the coordinator or decoder has stopped.
    pub async fn transcribe_wav(&self, wav: Vec<u8>) -> Result<Transcription> {
        request!(self, TranscribeWav { wav: wav })?
    }

    /// Out-of-band: recognize supplied text.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the coordinator or recognizer has
    /// stopped.
    pub async fn recognize_text(&self, text: &str) -> Result<IntentResult> {
        request!(self, RecognizeText { text: text.to_owned() })?
    }

    /// Out-of-band: dispatch an intent to the handler.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the coordinator or handler has stopped.
    pub async fn handle_intent(&self, intent: IntentResult) -> Result<IntentResult> {
        request!(self, HandleIntent { intent: intent })?
    }

    /// Out-of-band: play a spoken sentence's WAV through the speaker.
    ///
    /// Speech synthesis itself is the external collaborator's job; the
    /// coordinator forwards its output to the sound player. Resolves once
    /// playback is queued; playback failures are logged by the player.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the coordinator has stopped.
    pub async fn play_wav(&self, wav: Vec<u8>) -> Result<()> {
        request!(self, PlayWav { wav: wav })
    }

    /// Out-of-band: look up word pronunciations.
    ///
    /// # Errors
    ///
    /// Returns lookup errors or a channel error.
    pub async fn get_pronunciations(
        &self,
        words: Vec<String>,
        n: usize,
    ) -> Result<BTreeMap<String, WordPronunciation>> {
        request!(self, GetPronunciations { words: words, n: n })?
    }

    /// Run the training pipeline; with `reload`, retrained components are
    /// recreated afterwards.
    ///
    /// # Errors
    ///
    /// Returns the training failure, or an error when training is already
    /// in progress.
    pub async fn train(&self, reload: bool) -> Result<TrainingReport> {
        request!(self, Train { reload: reload })?
    }

    /// Current session state and the load-time problem map.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the coordinator has stopped.
    pub async fn state(&self) -> Result<(SessionState, ProblemMap)> {
        request!(self, GetState {})
    }

    /// The microphone source, for embedders that feed the dummy backend
    /// (WAV replay, composition tests).
    ///
    /// # Errors
    ///
    /// Returns a channel error when the coordinator has stopped.
    pub async fn audio_source(&self) -> Result<AudioSourceHandle> {
        request!(self, GetAudioSource {})
    }

    /// Stop the coordinator.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(DialogueMsg::Request(Request::Shutdown)).await;
    }
}

/// The coordinator's child actors.
struct Children {
    source: AudioSourceHandle,
    player: SoundPlayerHandle,
    wake: WakeHandle,
    listener: CommandListenerHandle,
    decoder: DecoderHandle,
    recognizer: RecognizerHandle,
    handler: HandlerHandle,
    pronounce: PronounceHandle,
}

fn recognizer_paths(profile: &Profile) -> RecognizerPaths {
    RecognizerPaths {
        intent_fst: profile.read_path(&profile.config.intent.fst.intent_fst),
        examples_json: profile.read_path(&profile.config.intent.fuzzy.examples_json),
        keyword_json: profile.read_path(&profile.config.intent.keyword.config_json),
    }
}

fn spawn_children(profile: &Profile) -> (Children, ProblemMap) {
    let config = &profile.config;
    let mut problems = ProblemMap::new();

    let source = source::spawn(config.audio.clone());
    let player = player::spawn(config.sounds.clone());

    let wake_refs = profile.read_path(&config.wake.references_dir);
    problems.insert("wake".into(), wake::check_problems(&config.wake, &wake_refs));
    let wake = wake::spawn(
        config.wake.clone(),
        config.audio.clone(),
        wake_refs,
        source.clone(),
    );

    let listener = listener::spawn(config.command.clone(), config.audio.clone(), source.clone());

    problems.insert("decoder".into(), decode::check_problems(&config.decode));
    let decoder = decode::spawn(config.decode.clone());

    let paths = recognizer_paths(profile);
    problems.insert(
        "recognizer".into(),
        recognize::check_problems(&config.intent, &paths),
    );
    let recognizer = recognize::spawn(config.intent.clone(), paths);

    problems.insert("handler".into(), handle::check_problems(&config.handle));
    let handler = handle::spawn(config.handle.clone());

    let pronounce = pronounce::spawn(profile);

    (
        Children {
            source,
            player,
            wake,
            listener,
            decoder,
            recognizer,
            handler,
            pronounce,
        },
        problems,
    )
}

/// Spawn the dialogue coordinator over a profile.
pub fn spawn(profile: Profile) -> DialogueHandle {
    let (tx, rx) = mpsc::channel(32);
    let handle = DialogueHandle { tx: tx.clone() };
    tokio::spawn(run(profile, tx, rx));
    handle
}

struct Dialogue {
    profile: Profile,
    state: SessionState,
    children: Children,
    problems: ProblemMap,
    tx: mpsc::Sender<DialogueMsg>,
    wake_events: mpsc::Sender<WakeEvent>,
    /// Reply slot for the request that started the current session.
    intent_receiver: Option<oneshot::Sender<IntentResult>>,
    /// Whether the current session's intent should be dispatched.
    handle_intent: bool,
    /// Reply slot for the in-flight training request.
    training_receiver: Option<oneshot::Sender<Result<TrainingReport>>>,
    reload_after_training: bool,
}

async fn run(
    profile: Profile,
    tx: mpsc::Sender<DialogueMsg>,
    mut rx: mpsc::Receiver<DialogueMsg>,
) {
    let (children, problems) = spawn_children(&profile);
    for (component, component_problems) in &problems {
        for (problem, detail) in component_problems {
            warn!("{component}: {problem}: {detail}");
        }
    }

    // Wake events funnel into the coordinator's own mailbox.
    let (wake_events, mut wake_rx) = mpsc::channel::<WakeEvent>(8);
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = wake_rx.recv().await {
                if let WakeEvent::Detected { keyphrase } = event {
                    let _ = tx
                        .send(DialogueMsg::Event(Event::WakeDetected { keyphrase }))
                        .await;
                }
            }
        });
    }

    let mut dialogue = Dialogue {
        profile,
        state: SessionState::Loading,
        children,
        problems,
        tx,
        wake_events,
        intent_receiver: None,
        handle_intent: true,
        training_receiver: None,
        reload_after_training: true,
    };

    // Load phase: wait for children to confirm configuration, bounded by
    // the profile's load timeout; on expiry, proceed with whatever loaded
    // and let the problem map tell the story.
    let load_timeout = std::time::Duration::from_secs_f32(
        dialogue.profile.config.load_timeout_sec.max(0.1),
    );
    match tokio::time::timeout(load_timeout, dialogue.children.wake.status()).await {
        Ok(Some(true)) | Ok(None) => {}
        Ok(Some(false)) => debug!("wake detector will load on first listen"),
        Err(_) => warn!("load timeout after {load_timeout:?}; continuing"),
    }

    info!("dialogue ready");
    dialogue.enter_ready().await;

    while let Some(message) = rx.recv().await {
        match message {
            DialogueMsg::Request(request) => {
                if dialogue.on_request(request).await {
                    break;
                }
            }
            DialogueMsg::Event(event) => dialogue.on_event(event).await,
        }
    }

    dialogue.children.source.shutdown().await;
    info!("dialogue stopped");
}

impl Dialogue {
    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            debug!("dialogue: {:?} -> {to:?}", self.state);
            self.state = to;
        }
    }

    /// Enter ready; with `listen_on_start`, fall straight through to
    /// asleep.
    async fn enter_ready(&mut self) {
        self.transition(SessionState::Ready);
        if self.profile.config.listen_on_start {
            self.start_wake_listening().await;
        }
    }

    async fn start_wake_listening(&mut self) {
        self.children.wake.listen(self.wake_events.clone()).await;
        self.transition(SessionState::Asleep);
    }

    /// Handle an external request; returns true on shutdown.
    async fn on_request(&mut self, request: Request) -> bool {
        match request {
            Request::ListenForWake { reply } => {
                if self.state.is_training() {
                    let _ = reply.send(Err(AssistantError::Training(
                        "training in progress".into(),
                    )));
                } else if self.state.in_session() {
                    let _ = reply.send(Err(AssistantError::Channel(
                        "voice session in progress".into(),
                    )));
                } else {
                    if self.state == SessionState::Ready {
                        info!("listening for wake word");
                        self.start_wake_listening().await;
                    }
                    let _ = reply.send(Ok(()));
                }
            }
            Request::ListenForCommand {
                handle,
                timeout_sec,
                reply,
            } => {
                if self.state.is_training() || self.state.in_session() {
                    let _ = reply.send(IntentResult::empty(""));
                } else {
                    if self.state == SessionState::Asleep {
                        self.children.wake.stop().await;
                    }
                    self.intent_receiver = Some(reply);
                    self.handle_intent = handle;
                    self.begin_command_capture(timeout_sec).await;
                }
            }
            Request::TranscribeWav { wav, reply } => {
                // Out-of-band: forwarded directly, session state untouched.
                let decoder = self.children.decoder.clone();
                tokio::spawn(async move {
                    let _ = reply.send(decoder.transcribe(wav).await);
                });
            }
            Request::RecognizeText { text, reply } => {
                let recognizer = self.children.recognizer.clone();
                tokio::spawn(async move {
                    let _ = reply.send(recognizer.recognize(&text, 1.0).await);
                });
            }
            Request::HandleIntent { intent, reply } => {
                let handler = self.children.handler.clone();
                tokio::spawn(async move {
                    let _ = reply.send(handler.handle(intent).await);
                });
            }
            Request::PlayWav { wav, reply } => {
                let player = self.children.player.clone();
                tokio::spawn(async move {
                    player.play_wav(wav).await;
                    let _ = reply.send(());
                });
            }
            Request::GetPronunciations { words, n, reply } => {
                let pronounce = self.children.pronounce.clone();
                tokio::spawn(async move {
                    let _ = reply.send(pronounce.lookup(words, n).await);
                });
            }
            Request::Train { reload, reply } => {
                if self.state.is_training() {
                    let _ = reply.send(Err(AssistantError::Training(
                        "training already in progress".into(),
                    )));
                } else {
                    self.begin_training(reload, reply).await;
                }
            }
            Request::GetState { reply } => {
                let _ = reply.send((self.state, self.problems.clone()));
            }
            Request::GetAudioSource { reply } => {
                let _ = reply.send(self.children.source.clone());
            }
            Request::Shutdown => return true,
        }
        false
    }

    async fn begin_command_capture(&mut self, timeout_sec: Option<f32>) {
        self.transition(SessionState::Awake);
        let listener = self.children.listener.clone();
        let handle = self.handle_intent;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = listener.listen(handle, timeout_sec).await;
            let _ = tx
                .send(DialogueMsg::Event(Event::CommandCaptured(result)))
                .await;
        });
    }

    async fn begin_training(
        &mut self,
        reload: bool,
        reply: oneshot::Sender<Result<TrainingReport>>,
    ) {
        info!("training started");
        // Training pauses wake listening; the request that arrives during
        // training gets a "training in progress" reply instead of silence.
        self.children.wake.stop().await;
        self.training_receiver = Some(reply);
        self.reload_after_training = reload;
        self.transition(SessionState::TrainingSentences);

        let trainer = Trainer::new(self.profile.clone());
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let phase_tx = tx.clone();
            let result = trainer.run(move |phase| {
                let _ = phase_tx.blocking_send(DialogueMsg::Event(Event::TrainingPhase(phase)));
            });
            let _ = tx.blocking_send(DialogueMsg::Event(Event::TrainingFinished(Box::new(
                result,
            ))));
        });
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::WakeDetected { keyphrase } => {
                if self.state != SessionState::Asleep {
                    debug!("ignoring late wake detection");
                    return;
                }
                info!("awake ('{keyphrase}')");
                self.children.wake.stop().await;
                self.play_chime(self.profile.config.sounds.wake.clone()).await;
                self.handle_intent = true;
                self.begin_command_capture(None).await;
            }
            Event::CommandCaptured(result) => {
                if self.state != SessionState::Awake {
                    return;
                }
                match result {
                    Ok(command) => {
                        self.play_chime(self.profile.config.sounds.recorded.clone())
                            .await;
                        if command.timed_out {
                            warn!("command capture timed out");
                        }
                        self.handle_intent = command.handle;
                        if command_is_empty(&command) {
                            // Nothing to decode; recognition still runs so
                            // the requester gets a (empty) result.
                            self.transition(SessionState::Decoding);
                            let _ = self
                                .tx
                                .send(DialogueMsg::Event(Event::Transcribed(
                                    Transcription::new(String::new(), 0.0),
                                )))
                                .await;
                        } else {
                            self.transition(SessionState::Decoding);
                            let decoder = self.children.decoder.clone();
                            let tx = self.tx.clone();
                            tokio::spawn(async move {
                                let transcription = decoder
                                    .transcribe(command.wav)
                                    .await
                                    .unwrap_or_else(|e| Transcription::failed(e.to_string()));
                                let _ = tx
                                    .send(DialogueMsg::Event(Event::Transcribed(transcription)))
                                    .await;
                            });
                        }
                    }
                    Err(e) => {
                        // Capture error: the session ends, the requester
                        // gets the empty intent.
                        error!("command capture failed: {e}");
                        self.reply_intent(IntentResult::empty("")).await;
                    }
                }
            }
            Event::Transcribed(transcription) => {
                if self.state != SessionState::Decoding {
                    return;
                }
                debug!(
                    "transcript: \"{}\" (confidence={:.2})",
                    transcription.text, transcription.confidence
                );
                self.transition(SessionState::Recognizing);
                let recognizer = self.children.recognizer.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = recognizer
                        .recognize(&transcription.text, transcription.confidence)
                        .await
                        .unwrap_or_else(|_| IntentResult::empty(&transcription.text));
                    let _ = tx.send(DialogueMsg::Event(Event::Recognized(result))).await;
                });
            }
            Event::Recognized(intent) => {
                if self.state != SessionState::Recognizing {
                    return;
                }
                if self.handle_intent && !intent.is_empty() {
                    self.transition(SessionState::Handling);
                    let handler = self.children.handler.clone();
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let handled = handler
                            .handle(intent.clone())
                            .await
                            .unwrap_or(intent);
                        let _ = tx.send(DialogueMsg::Event(Event::Handled(handled))).await;
                    });
                } else {
                    self.reply_intent(intent).await;
                }
            }
            Event::Handled(intent) => {
                if self.state != SessionState::Handling {
                    return;
                }
                self.reply_intent(intent).await;
            }
            Event::TrainingPhase(phase) => {
                if self.state.is_training() {
                    let state = match phase {
                        TrainingPhase::Sentences => SessionState::TrainingSentences,
                        TrainingPhase::Speech => SessionState::TrainingSpeech,
                        TrainingPhase::Intent => SessionState::TrainingIntent,
                    };
                    self.transition(state);
                }
            }
            Event::TrainingFinished(result) => {
                if !self.state.is_training() {
                    return;
                }
                let result = *result;
                match &result {
                    Ok(report) => {
                        info!(
                            "training complete ({} task(s) ran)",
                            report.ran.len()
                        );
                        if self.reload_after_training {
                            self.reload_trained_components();
                        }
                    }
                    Err(e) => {
                        // Previous artifacts remain; back to ready with the
                        // failure forwarded.
                        error!("training failed: {e}");
                    }
                }
                if let Some(reply) = self.training_receiver.take() {
                    let _ = reply.send(result);
                }
                self.enter_ready().await;
            }
        }
    }

    /// Replace the components whose artifacts changed; dropping the old
    /// handles lets their actors wind down and release loaded models.
    fn reload_trained_components(&mut self) {
        info!("reloading trained components");
        let config = self.profile.config.clone();

        let wake_refs = self.profile.read_path(&config.wake.references_dir);
        self.problems
            .insert("wake".into(), wake::check_problems(&config.wake, &wake_refs));
        self.children.wake = wake::spawn(
            config.wake.clone(),
            config.audio.clone(),
            wake_refs,
            self.children.source.clone(),
        );

        self.problems
            .insert("decoder".into(), decode::check_problems(&config.decode));
        self.children.decoder = decode::spawn(config.decode.clone());

        let paths = recognizer_paths(&self.profile);
        self.problems.insert(
            "recognizer".into(),
            recognize::check_problems(&config.intent, &paths),
        );
        self.children.recognizer = recognize::spawn(config.intent.clone(), paths);
    }

    async fn reply_intent(&mut self, intent: IntentResult) {
        if let Some(reply) = self.intent_receiver.take() {
            let _ = reply.send(intent);
        } else {
            debug!("session finished with no requester: {:?}", intent.intent.name);
        }
        self.enter_ready().await;
    }

    async fn play_chime(&self, path: Option<String>) {
        let Some(path) = path else { return };
        let resolved = if std::path::Path::new(&path).is_absolute() {
            std::path::PathBuf::from(path)
        } else {
            self.profile.read_path(&path)
        };
        // Fire and forget.
        self.children.player.play_file(&resolved).await;
    }
}

fn command_is_empty(command: &VoiceCommand) -> bool {
    crate::audio::wav::wav_to_pcm(&command.wav, 16_000)
        .map(|samples| samples.is_empty())
        .unwrap_or(true)
}
