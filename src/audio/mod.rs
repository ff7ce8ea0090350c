//! Audio capture, playback and WAV plumbing.

pub mod player;
pub mod source;
pub mod wav;
