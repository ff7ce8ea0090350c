//! Speech decoding: WAV buffer in, transcription out.
//!
//! The decoder guarantees its engine receives 16-bit/16 kHz/mono PCM; input
//! WAVs in any other format are converted first. Decoding covers the whole
//! utterance at once; no partial transcripts are exposed. Engine failures
//! collapse to an empty transcription with confidence 0 and the error
//! carried in the envelope.

use crate::audio::wav::{pcm_to_wav, wav_to_pcm};
use crate::config::{DecodeBackend, DecodeConfig};
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::Transcription;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// The sample rate every decoder engine is fed.
const DECODER_SAMPLE_RATE: u32 = 16_000;

enum DecoderCommand {
    Transcribe {
        wav: Vec<u8>,
        reply: oneshot::Sender<Transcription>,
    },
}

/// Handle to the speech decoder actor.
#[derive(Clone)]
pub struct DecoderHandle {
    tx: mpsc::Sender<DecoderCommand>,
}

impl DecoderHandle {
    /// Transcribe a WAV buffer.
    ///
    /// Never fails from the caller's perspective: engine errors come back as
    /// an empty transcription with the error in the envelope.
    ///
    /// # Errors
    ///
    /// Returns a channel error only when the decoder actor has stopped.
    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DecoderCommand::Transcribe { wav, reply })
            .await
            .map_err(|_| AssistantError::Channel("decoder stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("decoder stopped".into()))
    }
}

/// Configure-time checks, reported into the coordinator's problem map.
pub fn check_problems(config: &DecodeConfig) -> HashMap<String, String> {
    let mut problems = HashMap::new();
    match config.system {
        DecodeBackend::Command => {
            if config.command.program.is_empty() {
                problems.insert(
                    "no program".into(),
                    "decode.command.program is not set in the profile".into(),
                );
            } else if which::which(&config.command.program).is_err() {
                problems.insert(
                    "missing program".into(),
                    format!(
                        "decode command '{}' not found on PATH",
                        config.command.program
                    ),
                );
            }
        }
        DecodeBackend::Remote => {
            if config.remote_url.is_empty() {
                problems.insert(
                    "no url".into(),
                    "decode.remote_url is not set in the profile".into(),
                );
            }
        }
        DecodeBackend::Dummy => {}
    }
    problems
}

/// Spawn the speech decoder actor.
pub fn spawn(config: DecodeConfig) -> DecoderHandle {
    let (tx, mut rx) = mpsc::channel::<DecoderCommand>(8);
    tokio::spawn(async move {
        let decoder = SpeechDecoder::new(config);
        while let Some(DecoderCommand::Transcribe { wav, reply }) = rx.recv().await {
            let transcription = decoder.transcribe(&wav).await;
            let _ = reply.send(transcription);
        }
        debug!("decoder stopped");
    });
    DecoderHandle { tx }
}

/// The decoding engine wrapper.
pub struct SpeechDecoder {
    config: DecodeConfig,
    http: reqwest::Client,
}

impl SpeechDecoder {
    /// Create a decoder for the configured backend.
    pub fn new(config: DecodeConfig) -> Self {
        if config.preload {
            // The engines here hold no resident models; preloading is a
            // startup-time validation pass.
            info!("decoder configured: {:?}", config.system);
        }
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Transcribe a WAV buffer; errors collapse into the envelope.
    pub async fn transcribe(&self, wav: &[u8]) -> Transcription {
        match self.try_transcribe(wav).await {
            Ok(transcription) => {
                info!(
                    "transcribed: \"{}\" (confidence={:.2})",
                    transcription.text, transcription.confidence
                );
                transcription
            }
            Err(e) => {
                error!("decode failed: {e}");
                Transcription::failed(e.to_string())
            }
        }
    }

    async fn try_transcribe(&self, wav: &[u8]) -> Result<Transcription> {
        // Normalise whatever we were handed to the decoder contract.
        let samples = wav_to_pcm(wav, DECODER_SAMPLE_RATE)?;
        let canonical = pcm_to_wav(&samples, DECODER_SAMPLE_RATE)?;

        match self.config.system {
            DecodeBackend::Command => self.transcribe_command(&canonical).await,
            DecodeBackend::Remote => self.transcribe_remote(canonical).await,
            DecodeBackend::Dummy => Ok(Transcription::new(String::new(), 0.0)),
        }
    }

    async fn transcribe_command(&self, wav: &[u8]) -> Result<Transcription> {
        let mut child = Command::new(&self.config.command.program)
            .args(&self.config.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AssistantError::Decode(format!(
                    "cannot spawn '{}': {e}",
                    self.config.command.program
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AssistantError::Decode("decode command has no stdin".into()))?;
        stdin
            .write_all(wav)
            .await
            .map_err(|e| AssistantError::Decode(format!("stdin write: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AssistantError::Decode(format!("wait: {e}")))?;
        if !output.status.success() {
            return Err(AssistantError::Decode(format!(
                "decode command exited with {}",
                output.status
            )));
        }

        Ok(parse_engine_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn transcribe_remote(&self, wav: Vec<u8>) -> Result<Transcription> {
        let response = self
            .http
            .post(&self.config.remote_url)
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| AssistantError::Decode(format!("POST {}: {e}", self.config.remote_url)))?;

        let response = response
            .error_for_status()
            .map_err(|e| AssistantError::Decode(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| AssistantError::Decode(e.to_string()))?;

        Ok(parse_engine_output(&body))
    }
}

/// Engines may answer with plain text or a `{"text", "confidence"}` JSON
/// envelope; accept both.
fn parse_engine_output(raw: &str) -> Transcription {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && let Some(text) = value.get("text").and_then(|t| t.as_str())
    {
        let confidence = value
            .get("confidence")
            .and_then(|c| c.as_f64())
            .unwrap_or(1.0) as f32;
        return Transcription::new(text.trim().to_owned(), confidence.clamp(0.0, 1.0));
    }
    Transcription::new(trimmed.to_owned(), 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_output() {
        let t = parse_engine_output("turn on the kitchen light\n");
        assert_eq!(t.text, "turn on the kitchen light");
        assert_eq!(t.confidence, 1.0);
    }

    #[test]
    fn parses_json_output() {
        let t = parse_engine_output(r#"{"text": "open the door", "confidence": 0.85}"#);
        assert_eq!(t.text, "open the door");
        assert!((t.confidence - 0.85).abs() < 1e-6);
    }

    #[tokio::test]
    async fn dummy_backend_returns_empty() {
        let decoder = SpeechDecoder::new(DecodeConfig::default());
        let wav = crate::audio::wav::pcm_to_wav(&[0i16; 1600], 16_000).unwrap();
        let t = decoder.transcribe(&wav).await;
        assert!(t.text.is_empty());
        assert_eq!(t.confidence, 0.0);
        assert!(t.error.is_none());
    }

    #[tokio::test]
    async fn invalid_wav_collapses_to_envelope_error() {
        let decoder = SpeechDecoder::new(DecodeConfig::default());
        let t = decoder.transcribe(b"definitely not audio").await;
        assert!(t.text.is_empty());
        assert_eq!(t.confidence, 0.0);
        assert!(t.error.is_some());
    }

    #[tokio::test]
    async fn remote_backend_posts_wav() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"text": "hello world", "confidence": 0.9}"#),
            )
            .mount(&server)
            .await;

        let config = DecodeConfig {
            system: DecodeBackend::Remote,
            remote_url: format!("{}/stt", server.uri()),
            ..DecodeConfig::default()
        };
        let decoder = SpeechDecoder::new(config);
        let wav = crate::audio::wav::pcm_to_wav(&[100i16; 1600], 16_000).unwrap();
        let t = decoder.transcribe(&wav).await;
        assert_eq!(t.text, "hello world");
    }
}
