//! The assembled assistant.
//!
//! One owned [`Assistant`] value holds the profile snapshot and the
//! dialogue coordinator; there is no process-wide state. Dropping the
//! assistant (after [`Assistant::shutdown`]) winds down every actor.

use crate::config::Profile;
use crate::dialogue::{self, DialogueHandle};
use crate::error::Result;
use tracing::info;

/// A running assistant instance.
pub struct Assistant {
    profile: Profile,
    dialogue: DialogueHandle,
}

impl Assistant {
    /// Start every component for the given profile.
    ///
    /// # Errors
    ///
    /// Currently infallible at startup (components load lazily and report
    /// problems through the coordinator); the `Result` covers future
    /// construction-time validation.
    pub fn start(profile: Profile) -> Result<Self> {
        info!("starting assistant with profile '{}'", profile.name);
        let dialogue = dialogue::spawn(profile.clone());
        Ok(Self { profile, dialogue })
    }

    /// The profile this assistant was built from.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// The dialogue coordinator.
    pub fn dialogue(&self) -> &DialogueHandle {
        &self.dialogue
    }

    /// Stop the coordinator and all children.
    pub async fn shutdown(self) {
        self.dialogue.shutdown().await;
    }
}
