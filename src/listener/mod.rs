//! Voice-command listener: records speech bracketed by silence.
//!
//! Given a stream of PCM frames, the listener returns the command as a WAV
//! buffer. The bracketing state machine runs **before → in_phrase →
//! after_phrase → done**, with a frame-budget timeout that terminates the
//! recording in any state. The minimum-phrase counter is reset at phrase
//! start only.

pub mod vad;

use crate::audio::source::AudioSourceHandle;
use crate::audio::wav::pcm_to_wav;
use crate::config::{AudioConfig, CommandConfig};
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::{AudioFrame, VoiceCommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use vad::EnergyVad;

/// Where the recorder is in the bracketing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecorderState {
    /// Discarding startup noise, waiting for leading speech.
    Before,
    /// Accumulating the phrase.
    InPhrase,
    /// Trailing silence seen; accumulating the final padding.
    AfterPhrase,
}

/// Result of a completed recording.
#[derive(Debug)]
pub struct RecorderOutcome {
    /// Accumulated 16-bit samples.
    pub samples: Vec<i16>,
    /// The frame budget ran out before trailing silence completed.
    pub timed_out: bool,
}

/// The voice-activity bracketing state machine.
///
/// Pure with respect to I/O: feed frames with [`CommandRecorder::push_frame`]
/// until it yields an outcome.
pub struct CommandRecorder {
    vad: EnergyVad,
    state: RecorderState,
    buffer: Vec<i16>,
    /// Frames left before the overall timeout.
    max_frames_left: usize,
    /// Initial frames still to discard.
    throwaway_left: usize,
    /// Consecutive speech frames still required to start the phrase.
    leading_speech_left: usize,
    leading_speech_frames: usize,
    /// Frames left in the minimum-phrase window (silence ignored within it).
    min_phrase_left: usize,
    /// Silence frames left before the phrase ends / padding completes.
    silence_left: usize,
    silence_frames: usize,
}

impl CommandRecorder {
    /// Build a recorder from the listener configuration.
    ///
    /// `timeout_sec` overrides the configured maximum command length.
    pub fn new(config: &CommandConfig, audio: &AudioConfig, timeout_sec: Option<f32>) -> Self {
        let frame_sec = audio.frame_ms as f32 / 1000.0;
        let timeout = timeout_sec.unwrap_or(config.max_command_sec);

        let max_frames = (timeout / frame_sec).ceil() as usize;
        let silence_frames = (config.silence_trailing_sec / frame_sec).ceil() as usize;
        let min_phrase_frames = (config.min_command_sec / frame_sec).ceil() as usize;

        Self {
            vad: EnergyVad::new(config.vad_aggressiveness),
            state: RecorderState::Before,
            buffer: Vec::new(),
            max_frames_left: max_frames.max(1),
            throwaway_left: config.throwaway_frames,
            leading_speech_left: config.leading_speech_frames,
            leading_speech_frames: config.leading_speech_frames,
            min_phrase_left: min_phrase_frames,
            silence_left: silence_frames,
            silence_frames,
        }
    }

    /// Give up now, returning whatever was buffered as a timed-out command.
    pub fn finish_timed_out(&mut self) -> RecorderOutcome {
        RecorderOutcome {
            samples: std::mem::take(&mut self.buffer),
            timed_out: true,
        }
    }

    /// Feed one frame; returns the outcome once the recording is complete.
    pub fn push_frame(&mut self, samples: &[i16]) -> Option<RecorderOutcome> {
        self.max_frames_left = self.max_frames_left.saturating_sub(1);
        if self.max_frames_left == 0 {
            warn!("command timeout");
            return Some(RecorderOutcome {
                samples: std::mem::take(&mut self.buffer),
                timed_out: true,
            });
        }

        // Throw away the first frames: device startup noise.
        if self.throwaway_left > 0 {
            self.throwaway_left -= 1;
            return None;
        }

        let is_speech = self.vad.is_speech(samples);

        match self.state {
            RecorderState::Before => {
                if is_speech {
                    if self.leading_speech_left > 1 {
                        self.leading_speech_left -= 1;
                    } else {
                        // Enough consecutive speech: the phrase starts here.
                        self.state = RecorderState::InPhrase;
                        self.buffer.extend_from_slice(samples);
                        debug!("phrase started");
                    }
                } else {
                    // Spurious trigger; require the full run again.
                    self.leading_speech_left = self.leading_speech_frames;
                }
            }
            RecorderState::InPhrase => {
                self.buffer.extend_from_slice(samples);
                if self.min_phrase_left > 0 {
                    // Ignore silence until the minimum length is met.
                    self.min_phrase_left -= 1;
                } else if is_speech {
                    self.silence_left = self.silence_frames;
                } else {
                    self.silence_left = self.silence_left.saturating_sub(1);
                    if self.silence_left == 0 {
                        self.state = RecorderState::AfterPhrase;
                        self.silence_left = self.silence_frames;
                        debug!("phrase ended, padding");
                    }
                }
            }
            RecorderState::AfterPhrase => {
                self.buffer.extend_from_slice(samples);
                self.silence_left = self.silence_left.saturating_sub(1);
                if self.silence_left == 0 {
                    return Some(RecorderOutcome {
                        samples: std::mem::take(&mut self.buffer),
                        timed_out: false,
                    });
                }
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum ListenerCommand {
    Listen {
        handle: bool,
        timeout_sec: Option<f32>,
        reply: oneshot::Sender<Result<VoiceCommand>>,
    },
}

/// Handle to the command listener actor.
#[derive(Clone)]
pub struct CommandListenerHandle {
    tx: mpsc::Sender<ListenerCommand>,
}

impl CommandListenerHandle {
    /// Record one voice command and return it as a WAV buffer.
    ///
    /// # Errors
    ///
    /// Returns an audio error when the capture session ends before the
    /// command completes, or a channel error when the listener has stopped.
    pub async fn listen(&self, handle: bool, timeout_sec: Option<f32>) -> Result<VoiceCommand> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ListenerCommand::Listen {
                handle,
                timeout_sec,
                reply,
            })
            .await
            .map_err(|_| AssistantError::Channel("command listener stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("command listener stopped".into()))?
    }
}

/// Spawn the command listener actor.
///
/// The listener is idle until asked to listen; while recording it is the
/// only pipeline consumer of microphone frames besides named buffers.
pub fn spawn(
    config: CommandConfig,
    audio: AudioConfig,
    source: AudioSourceHandle,
) -> CommandListenerHandle {
    let (tx, mut rx) = mpsc::channel::<ListenerCommand>(8);

    tokio::spawn(async move {
        while let Some(ListenerCommand::Listen {
            handle,
            timeout_sec,
            reply,
        }) = rx.recv().await
        {
            let result = record_one(&config, &audio, &source, timeout_sec, handle).await;
            let _ = reply.send(result);
        }
    });

    CommandListenerHandle { tx }
}

async fn record_one(
    config: &CommandConfig,
    audio: &AudioConfig,
    source: &AudioSourceHandle,
    timeout_sec: Option<f32>,
    handle: bool,
) -> Result<VoiceCommand> {
    let frame_samples = audio.frame_samples();
    let mut recorder = CommandRecorder::new(config, audio, timeout_sec);

    let (sink, mut frames) = mpsc::channel::<AudioFrame>(audio.channel_capacity);
    let id = source.start_streaming(sink).await?;
    info!("listening for command");

    // Wall-clock backstop: the frame budget handles the normal timeout, but
    // cannot fire if the source starves.
    let limit = timeout_sec.unwrap_or(config.max_command_sec) + 1.0;
    let deadline = tokio::time::sleep(std::time::Duration::from_secs_f32(limit.max(0.1)));
    tokio::pin!(deadline);

    // Frames normally arrive at the configured size; re-chunk defensively so
    // the VAD always sees exact frame-length windows.
    let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);
    let outcome = loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            () = &mut deadline => {
                warn!("command capture starved; timing out");
                break recorder.finish_timed_out();
            }
        };
        let Some(frame) = frame else {
            source.stop_streaming(id).await;
            return Err(AssistantError::Channel("frame stream closed".into()));
        };
        if frame.is_end_of_stream() {
            source.stop_streaming(id).await;
            return Err(AssistantError::Audio("capture ended mid-command".into()));
        }

        pending.extend_from_slice(&frame.samples);
        let mut finished = None;
        while pending.len() >= frame_samples {
            let chunk: Vec<i16> = pending.drain(..frame_samples).collect();
            if let Some(outcome) = recorder.push_frame(&chunk) {
                finished = Some(outcome);
                break;
            }
        }
        if let Some(outcome) = finished {
            break outcome;
        }
    };

    source.stop_streaming(id).await;

    let seconds = outcome.samples.len() as f32 / audio.sample_rate as f32;
    info!(
        "command captured: {seconds:.1}s, timed_out={}",
        outcome.timed_out
    );

    Ok(VoiceCommand {
        wav: pcm_to_wav(&outcome.samples, audio.sample_rate)?,
        timed_out: outcome.timed_out,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> (CommandConfig, AudioConfig) {
        let command = CommandConfig {
            vad_aggressiveness: 1,
            min_command_sec: 0.09, // 3 frames at 30ms
            silence_trailing_sec: 0.06, // 2 frames
            max_command_sec: 3.0,  // 100 frames
            throwaway_frames: 2,
            leading_speech_frames: 2,
        };
        (command, AudioConfig::default())
    }

    fn speech_frame(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
            .collect()
    }

    fn silence_frame(len: usize) -> Vec<i16> {
        vec![0; len]
    }

    #[test]
    fn brackets_speech_between_silence() {
        let (command, audio) = test_config();
        let frame_len = audio.frame_samples();
        let mut recorder = CommandRecorder::new(&command, &audio, None);

        let speech = speech_frame(frame_len);
        let silence = silence_frame(frame_len);

        // Throwaway + leading silence.
        for _ in 0..4 {
            assert!(recorder.push_frame(&silence).is_none());
        }
        // Leading speech run, then phrase body.
        for _ in 0..8 {
            assert!(recorder.push_frame(&speech).is_none());
        }
        // Trailing silence ends the phrase, then padding completes it.
        let mut outcome = None;
        for _ in 0..8 {
            if let Some(done) = recorder.push_frame(&silence) {
                outcome = Some(done);
                break;
            }
        }

        let outcome = outcome.expect("recording should complete");
        assert!(!outcome.timed_out);
        // Recorded span covers at least the minimum command length.
        let min_samples = (0.09 * audio.sample_rate as f32) as usize;
        assert!(outcome.samples.len() >= min_samples);
        // The final padding frames are all silence.
        let tail = &outcome.samples[outcome.samples.len() - frame_len..];
        assert!(tail.iter().all(|&s| s == 0));
    }

    #[test]
    fn continuous_silence_times_out_empty() {
        let (command, audio) = test_config();
        let frame_len = audio.frame_samples();
        let mut recorder = CommandRecorder::new(&command, &audio, Some(0.3));

        let silence = silence_frame(frame_len);
        let mut outcome = None;
        for _ in 0..50 {
            if let Some(done) = recorder.push_frame(&silence) {
                outcome = Some(done);
                break;
            }
        }

        let outcome = outcome.expect("timeout should fire");
        assert!(outcome.timed_out);
        assert!(outcome.samples.is_empty());
    }

    #[test]
    fn spurious_speech_blip_does_not_start_phrase() {
        let (command, audio) = test_config();
        let frame_len = audio.frame_samples();
        let mut recorder = CommandRecorder::new(&command, &audio, None);

        let speech = speech_frame(frame_len);
        let silence = silence_frame(frame_len);

        for _ in 0..2 {
            recorder.push_frame(&silence); // throwaway
        }
        // One speech frame, then silence: below leading_speech_frames.
        recorder.push_frame(&speech);
        recorder.push_frame(&silence);
        assert_eq!(recorder.state, RecorderState::Before);
        // The run requirement is back to the full count.
        assert_eq!(recorder.leading_speech_left, 2);
    }

    #[test]
    fn speech_resets_trailing_silence() {
        let (command, audio) = test_config();
        let frame_len = audio.frame_samples();
        let mut recorder = CommandRecorder::new(&command, &audio, None);

        let speech = speech_frame(frame_len);
        let silence = silence_frame(frame_len);

        for _ in 0..2 {
            recorder.push_frame(&silence);
        }
        for _ in 0..6 {
            recorder.push_frame(&speech);
        }
        // One silence frame, then more speech: the silence run restarts.
        assert!(recorder.push_frame(&silence).is_none());
        assert!(recorder.push_frame(&speech).is_none());
        assert_eq!(recorder.state, RecorderState::InPhrase);
        assert_eq!(recorder.silence_left, recorder.silence_frames);
    }

    #[tokio::test]
    async fn actor_records_from_injected_frames() {
        use crate::audio::source;
        use crate::audio::wav::wav_to_pcm;
        use crate::config::MicBackend;

        let (command, audio) = test_config();
        let mut source_config = audio.clone();
        source_config.system = MicBackend::Dummy;
        let hub = source::spawn(source_config);
        let listener = spawn(command, audio.clone(), hub.clone());

        let frame_len = audio.frame_samples();
        let feeder = {
            let hub = hub.clone();
            tokio::spawn(async move {
                // Give the listener time to subscribe before feeding.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                for _ in 0..4 {
                    hub.inject(AudioFrame {
                        samples: silence_frame(frame_len),
                        sample_rate: 16_000,
                    })
                    .await;
                }
                for _ in 0..10 {
                    hub.inject(AudioFrame {
                        samples: speech_frame(frame_len),
                        sample_rate: 16_000,
                    })
                    .await;
                }
                for _ in 0..10 {
                    hub.inject(AudioFrame {
                        samples: silence_frame(frame_len),
                        sample_rate: 16_000,
                    })
                    .await;
                }
            })
        };

        let command = listener.listen(true, None).await.unwrap();
        feeder.await.unwrap();

        assert!(!command.timed_out);
        assert!(command.handle);
        let pcm = wav_to_pcm(&command.wav, 16_000).unwrap();
        assert!(!pcm.is_empty());
    }
}
