//! Feedback chime playback.
//!
//! The coordinator plays short WAV chimes on wake and on command capture.
//! Playback is fire-and-forget: failures are logged and never affect the
//! session state machine.

use crate::config::{SoundBackend, SoundsConfig};
use crate::error::{AssistantError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

enum PlayerCommand {
    PlayWav(Vec<u8>),
}

/// Handle to the chime player actor.
#[derive(Clone)]
pub struct SoundPlayerHandle {
    tx: mpsc::Sender<PlayerCommand>,
}

impl SoundPlayerHandle {
    /// Queue a WAV buffer for playback and return immediately.
    pub async fn play_wav(&self, wav: Vec<u8>) {
        let _ = self.tx.send(PlayerCommand::PlayWav(wav)).await;
    }

    /// Queue a WAV file for playback and return immediately.
    pub async fn play_file(&self, path: &Path) {
        match std::fs::read(path) {
            Ok(wav) => self.play_wav(wav).await,
            Err(e) => error!("cannot read chime {}: {e}", path.display()),
        }
    }
}

/// Spawn the chime player actor.
pub fn spawn(config: SoundsConfig) -> SoundPlayerHandle {
    let (tx, mut rx) = mpsc::channel::<PlayerCommand>(8);
    tokio::spawn(async move {
        while let Some(PlayerCommand::PlayWav(wav)) = rx.recv().await {
            match config.system {
                SoundBackend::Dummy => debug!("discarding {}-byte chime (dummy player)", wav.len()),
                SoundBackend::Cpal => {
                    // Playback blocks for the chime duration; keep it off the
                    // async workers.
                    let result =
                        tokio::task::spawn_blocking(move || play_wav_blocking(&wav)).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("chime playback failed: {e}"),
                        Err(e) => error!("chime playback task failed: {e}"),
                    }
                }
            }
        }
    });
    SoundPlayerHandle { tx }
}

fn play_wav_blocking(wav: &[u8]) -> Result<()> {
    let reader = hound::WavReader::new(std::io::Cursor::new(wav))
        .map_err(|e| AssistantError::Audio(format!("chime decode: {e}")))?;
    let spec = reader.spec();
    let samples = super::wav::wav_to_pcm(wav, spec.sample_rate)?;
    let samples: Vec<f32> = samples
        .iter()
        .map(|&s| s as f32 / i16::MAX as f32)
        .collect();

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AssistantError::Audio("no default output device".into()))?;

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("playing chime on {device_name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: spec.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let buffer_cb = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_cb.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    if buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| AssistantError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| AssistantError::Audio(format!("failed to start output stream: {e}")))?;

    loop {
        std::thread::sleep(std::time::Duration::from_millis(10));
        let done = buffer
            .lock()
            .map(|b| b.finished)
            .map_err(|e| AssistantError::Audio(format!("playback buffer poisoned: {e}")))?;
        if done {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}
