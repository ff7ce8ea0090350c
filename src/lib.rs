//! Hark: an offline, on-device voice assistant runtime.
//!
//! The runtime is a cooperating set of audio-processing actors:
//! Microphone → Wake Detector → Command Listener → Speech Decoder →
//! Intent Recognizer → Intent Handler, orchestrated by a dialogue
//! coordinator that owns the session state machine.
//!
//! A separate training pipeline compiles a declarative sentence grammar
//! into the artifacts the runtime consumes: per-intent JSGF grammars, a
//! merged intent FST, a pronunciation dictionary (with G2P fallback) and
//! an ARPA language model.
//!
//! # Architecture
//!
//! Components are actors with private state and a mailbox; everything
//! crossing a component boundary is a typed message. Exactly one
//! microphone is owned by the audio source, which fans frames out to
//! subscribers with reference-counted device acquisition.

pub mod audio;
pub mod config;
pub mod decode;
pub mod dialogue;
pub mod error;
pub mod fst;
pub mod handle;
pub mod listener;
pub mod pipeline;
pub mod pronounce;
pub mod recognize;
pub mod runtime;
pub mod train;
pub mod wake;

pub use config::{AssistantConfig, Profile};
pub use error::{AssistantError, Result};
pub use pipeline::messages::{IntentResult, Transcription, VoiceCommand};
pub use runtime::Assistant;
