//! Message types passed between pipeline components.
//!
//! Components never share mutable state; everything crossing a component
//! boundary is one of these types, sent over a mailbox.

use serde::{Deserialize, Serialize};

/// A fixed-size chunk of 16-bit mono PCM from the microphone source.
///
/// Frames are immutable once produced and are delivered to every subscriber
/// in production order. A frame with no samples is the end-of-stream marker:
/// the capture session has ended (normally or on error) and no further
/// frames will follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Signed 16-bit samples, mono.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioFrame {
    /// The end-of-stream marker.
    pub fn end_of_stream(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    /// Whether this frame marks the end of the stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples as little-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }
}

/// A captured voice command, bracketed by silence.
#[derive(Debug, Clone)]
pub struct VoiceCommand {
    /// The captured audio as a 16-bit/16 kHz/mono WAV buffer.
    pub wav: Vec<u8>,
    /// The listener hit its time limit before trailing silence was seen.
    pub timed_out: bool,
    /// Whether the resulting intent should be dispatched to the handler.
    pub handle: bool,
}

/// A transcription produced by the speech decoder.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// The transcribed text; empty on decoder failure.
    pub text: String,
    /// Decoder confidence in [0, 1].
    pub confidence: f32,
    /// Engine failure carried in the envelope; recognition still proceeds
    /// with the empty text.
    pub error: Option<String>,
}

impl Transcription {
    /// A successful transcription.
    pub fn new(text: String, confidence: f32) -> Self {
        Self {
            text,
            confidence,
            error: None,
        }
    }

    /// The empty transcription a failed decode collapses to.
    pub fn failed(error: String) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            error: Some(error),
        }
    }
}

/// The structured result of intent recognition.
///
/// This is the shape that crosses the system boundary, so field names and
/// optionality are part of the JSON contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentResult {
    /// The (possibly normalised) text the intent was recognised from.
    pub text: String,
    /// The recognised intent.
    pub intent: IntentRef,
    /// Slot values attached to the intent.
    pub entities: Vec<Entity>,
    /// The transcript as received, before any token filtering.
    pub raw_text: String,
    /// Confidence of the transcription this intent came from.
    pub speech_confidence: f32,
    /// Dispatch failure annotation; absent unless the handler failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The event that was (or would have been) dispatched, for debugging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<DispatchedEvent>,
}

impl IntentResult {
    /// The empty-intent sentinel: no name, no entities.
    pub fn empty(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            raw_text: text.to_owned(),
            ..Self::default()
        }
    }

    /// Whether this is the empty-intent sentinel.
    pub fn is_empty(&self) -> bool {
        self.intent.name.is_empty()
    }
}

/// An intent name with its recognition confidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentRef {
    /// Intent name; empty for the empty-intent sentinel.
    pub name: String,
    /// Recognition confidence in [0, 1].
    pub confidence: f32,
}

/// A named slot value recognised inside a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Slot name.
    pub entity: String,
    /// Normalised slot value.
    pub value: String,
    /// Character offset of the span start in `text`, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    /// Character offset one past the span end, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    /// Per-entity confidence, when the recognizer provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Entity {
    /// An entity with just a name and value.
    pub fn new(entity: &str, value: &str) -> Self {
        Self {
            entity: entity.to_owned(),
            value: value.to_owned(),
            start: None,
            end: None,
            confidence: None,
        }
    }
}

/// The event sent to the home-automation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedEvent {
    /// Event type, built from the configured template and the intent name.
    pub event_type: String,
    /// Entity name → value payload.
    pub event_data: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_intent_sentinel() {
        let result = IntentResult::empty("turn on the kitchen light");
        assert!(result.is_empty());
        assert!(result.entities.is_empty());
        assert_eq!(result.intent.confidence, 0.0);
    }

    #[test]
    fn intent_json_shape() {
        let mut result = IntentResult::empty("turn on the kitchen light");
        result.intent = IntentRef {
            name: "ChangeLightState".into(),
            confidence: 1.0,
        };
        result.entities.push(Entity {
            entity: "name".into(),
            value: "kitchen".into(),
            start: Some(12),
            end: Some(19),
            confidence: None,
        });

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["intent"]["name"], "ChangeLightState");
        assert_eq!(json["entities"][0]["entity"], "name");
        // Absent optionals are omitted, not null.
        assert!(json["entities"][0].get("confidence").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn end_of_stream_marker() {
        let frame = AudioFrame::end_of_stream(16_000);
        assert!(frame.is_end_of_stream());
        assert!(frame.to_bytes().is_empty());
    }
}
