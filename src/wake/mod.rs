//! Wake-word detection.
//!
//! The detector is an actor with states **idle → loaded → listening →
//! idle**. While listening it consumes microphone frames, re-chunks them to
//! the detector's preferred size and emits [`WakeEvent::Detected`] when the
//! configured keyphrase is recognised. Backends share one interface and
//! event contract; the choice is configuration.

pub mod spotter;

use crate::audio::source::{AudioSourceHandle, SubscriberId};
use crate::config::{AudioConfig, WakeBackend, WakeConfig};
use crate::error::Result;
use crate::pipeline::messages::AudioFrame;
use spotter::KeyphraseSpotter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events emitted while listening.
#[derive(Debug, Clone)]
pub enum WakeEvent {
    /// The keyphrase was recognised.
    Detected {
        /// The configured keyphrase.
        keyphrase: String,
    },
    /// A chunk was processed without a match (diagnostics only).
    NotDetected,
}

enum WakeCommand {
    Listen {
        events: mpsc::Sender<WakeEvent>,
    },
    Stop,
    /// Configuration round-trip: answers once startup (including any
    /// preload) has been processed.
    Status {
        reply: tokio::sync::oneshot::Sender<bool>,
    },
}

/// Handle to the wake detector actor.
#[derive(Clone)]
pub struct WakeHandle {
    tx: mpsc::Sender<WakeCommand>,
}

impl WakeHandle {
    /// Start listening; detections go to `events`.
    pub async fn listen(&self, events: mpsc::Sender<WakeEvent>) {
        let _ = self.tx.send(WakeCommand::Listen { events }).await;
    }

    /// Stop listening and return to the loaded state.
    pub async fn stop(&self) {
        let _ = self.tx.send(WakeCommand::Stop).await;
    }

    /// Whether the detector has its resources loaded. Resolves once the
    /// actor has processed startup, so the coordinator's load phase can
    /// wait on it.
    pub async fn status(&self) -> Option<bool> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.tx.send(WakeCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Configure-time checks, reported into the coordinator's problem map.
pub fn check_problems(config: &WakeConfig, references_dir: &std::path::Path) -> HashMap<String, String> {
    let mut problems = HashMap::new();
    match config.system {
        WakeBackend::Spotter => {
            if config.keyphrase.is_empty() {
                problems.insert(
                    "no keyphrase".into(),
                    "wake.keyphrase is not set in the profile".into(),
                );
            }
            if !references_dir.is_dir() {
                problems.insert(
                    "missing references".into(),
                    format!(
                        "no keyphrase reference recordings at {}",
                        references_dir.display()
                    ),
                );
            }
        }
        WakeBackend::Command => {
            if which::which(&config.command.program).is_err() {
                problems.insert(
                    "missing program".into(),
                    format!("wake command '{}' not found on PATH", config.command.program),
                );
            }
        }
        WakeBackend::Dummy => {}
    }
    problems
}

/// Spawn the wake detector actor.
pub fn spawn(
    config: WakeConfig,
    audio: AudioConfig,
    references_dir: PathBuf,
    source: AudioSourceHandle,
) -> WakeHandle {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(run(config, audio, references_dir, source, rx));
    WakeHandle { tx }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeState {
    Idle,
    Loaded,
    Listening,
}

struct WakeActor {
    config: WakeConfig,
    audio: AudioConfig,
    references_dir: PathBuf,
    source: AudioSourceHandle,
    state: WakeState,
    spotter: Option<KeyphraseSpotter>,
    events: Option<mpsc::Sender<WakeEvent>>,
    subscription: Option<SubscriberId>,
    /// Re-chunking buffer: incoming frames → detector-preferred chunks.
    pending: Vec<i16>,
    child: Option<(Child, ChildStdin)>,
    last_detection: Option<Instant>,
}

/// Suppress duplicate detections within this window.
const DETECTION_COOLDOWN: Duration = Duration::from_secs(2);

impl WakeActor {
    fn transition(&mut self, to: WakeState) {
        if self.state != to {
            debug!("wake: {:?} -> {to:?}", self.state);
            self.state = to;
        }
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        match self.config.system {
            WakeBackend::Spotter => {
                if self.spotter.is_none() {
                    let spotter = KeyphraseSpotter::load(
                        &self.references_dir,
                        self.config.threshold,
                        self.audio.sample_rate,
                    )?;
                    self.spotter = Some(spotter);
                }
            }
            WakeBackend::Command | WakeBackend::Dummy => {}
        }
        if self.state == WakeState::Idle {
            self.transition(WakeState::Loaded);
        }
        Ok(())
    }

    async fn start_listening(
        &mut self,
        events: mpsc::Sender<WakeEvent>,
        frames_tx: mpsc::Sender<AudioFrame>,
    ) {
        if self.state == WakeState::Listening {
            // Replace the event sink; the stream is already running.
            self.events = Some(events);
            return;
        }

        if let Err(e) = self.ensure_loaded() {
            // Stay idle; the problem was already reported at configure time.
            error!("wake detector failed to load: {e}");
            return;
        }

        if self.config.system == WakeBackend::Command {
            match self.spawn_child(events.clone()) {
                Ok(child) => self.child = Some(child),
                Err(e) => {
                    error!("wake command failed to start: {e}");
                    return;
                }
            }
        }

        match self.source.start_streaming(frames_tx).await {
            Ok(id) => {
                self.subscription = Some(id);
                self.events = Some(events);
                self.pending.clear();
                self.transition(WakeState::Listening);
                info!("listening for keyphrase '{}'", self.config.keyphrase);
            }
            Err(e) => error!("wake detector cannot subscribe: {e}"),
        }
    }

    async fn stop_listening(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.source.stop_streaming(id).await;
        }
        if let Some((mut child, stdin)) = self.child.take() {
            drop(stdin);
            let _ = child.kill().await;
        }
        if let Some(spotter) = self.spotter.as_mut() {
            spotter.clear();
        }
        self.events = None;
        if self.state == WakeState::Listening {
            self.transition(WakeState::Loaded);
        }
    }

    fn spawn_child(&self, events: mpsc::Sender<WakeEvent>) -> Result<(Child, ChildStdin)> {
        let mut child = Command::new(&self.config.command.program)
            .args(&self.config.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                crate::error::AssistantError::Wake(format!(
                    "cannot spawn '{}': {e}",
                    self.config.command.program
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            crate::error::AssistantError::Wake("wake command has no stdin".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            crate::error::AssistantError::Wake("wake command has no stdout".into())
        })?;

        // Any line on stdout is a detection report.
        let keyphrase = self.config.keyphrase.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_owned();
                if !line.is_empty() {
                    debug!("wake command reported: {line}");
                    let _ = events
                        .send(WakeEvent::Detected {
                            keyphrase: keyphrase.clone(),
                        })
                        .await;
                }
            }
        });

        Ok((child, stdin))
    }

    async fn on_frame(&mut self, frame: AudioFrame) {
        if frame.is_end_of_stream() {
            warn!("capture ended while listening for the keyphrase");
            self.stop_listening().await;
            return;
        }

        match self.config.system {
            WakeBackend::Spotter => {
                self.pending.extend_from_slice(&frame.samples);
                let chunk_len = self.config.chunk_samples.max(1);
                while self.pending.len() >= chunk_len {
                    let chunk: Vec<i16> = self.pending.drain(..chunk_len).collect();
                    self.process_chunk(&chunk).await;
                }
            }
            WakeBackend::Command => {
                if let Some((_, stdin)) = self.child.as_mut()
                    && stdin.write_all(&frame.to_bytes()).await.is_err()
                {
                    warn!("wake command stdin closed");
                    self.stop_listening().await;
                }
            }
            WakeBackend::Dummy => {}
        }
    }

    async fn process_chunk(&mut self, chunk: &[i16]) {
        let Some(spotter) = self.spotter.as_mut() else {
            return;
        };
        match spotter.process(chunk) {
            Some(score) => {
                let in_cooldown = self
                    .last_detection
                    .is_some_and(|t| t.elapsed() < DETECTION_COOLDOWN);
                if !in_cooldown {
                    info!("keyphrase detected (score={score:.2})");
                    self.last_detection = Some(Instant::now());
                    spotter.clear();
                    if let Some(events) = &self.events {
                        let _ = events
                            .send(WakeEvent::Detected {
                                keyphrase: self.config.keyphrase.clone(),
                            })
                            .await;
                    }
                }
            }
            None => {
                if self.config.not_detected
                    && let Some(events) = &self.events
                {
                    let _ = events.send(WakeEvent::NotDetected).await;
                }
            }
        }
    }
}

async fn run(
    config: WakeConfig,
    audio: AudioConfig,
    references_dir: PathBuf,
    source: AudioSourceHandle,
    mut rx: mpsc::Receiver<WakeCommand>,
) {
    let preload = config.preload;
    let channel_capacity = audio.channel_capacity;
    let mut actor = WakeActor {
        config,
        audio,
        references_dir,
        source,
        state: WakeState::Idle,
        spotter: None,
        events: None,
        subscription: None,
        pending: Vec::new(),
        child: None,
        last_detection: None,
    };

    if preload && let Err(e) = actor.ensure_loaded() {
        warn!("wake detector preload failed: {e}");
    }

    let (frames_tx, mut frames_rx) = mpsc::channel::<AudioFrame>(channel_capacity);

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(WakeCommand::Listen { events }) => {
                        actor.start_listening(events, frames_tx.clone()).await;
                    }
                    Some(WakeCommand::Stop) => actor.stop_listening().await,
                    Some(WakeCommand::Status { reply }) => {
                        let loaded = actor.state != WakeState::Idle
                            || actor.config.system != WakeBackend::Spotter
                            || actor.spotter.is_some();
                        let _ = reply.send(loaded);
                    }
                    None => break,
                }
            }
            frame = frames_rx.recv(), if actor.state == WakeState::Listening => {
                match frame {
                    Some(frame) => actor.on_frame(frame).await,
                    None => break,
                }
            }
        }
    }

    actor.stop_listening().await;
    debug!("wake detector stopped");
}
