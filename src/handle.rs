//! Intent dispatch to the home-automation collaborator.
//!
//! A recognised intent becomes an event POST: the event type is formed from
//! a configured template and the intent name, the body is a map of entity
//! names to values. Network failures annotate the intent with `error` and
//! return; the handler never retries.

use crate::config::{HandleBackend, HandleConfig};
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::{DispatchedEvent, IntentResult};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Environment variable consulted for a bearer token when the profile has
/// none (e.g. supervised deployments injecting credentials).
pub const TOKEN_ENV: &str = "HARK_HA_TOKEN";

enum HandlerCommand {
    Handle {
        intent: IntentResult,
        reply: oneshot::Sender<IntentResult>,
    },
}

/// Handle to the intent handler actor.
#[derive(Clone)]
pub struct HandlerHandle {
    tx: mpsc::Sender<HandlerCommand>,
}

impl HandlerHandle {
    /// Dispatch an intent; the returned intent carries the event that was
    /// sent, or an `error` annotation on failure.
    ///
    /// # Errors
    ///
    /// Returns a channel error only when the handler actor has stopped.
    pub async fn handle(&self, intent: IntentResult) -> Result<IntentResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HandlerCommand::Handle { intent, reply })
            .await
            .map_err(|_| AssistantError::Channel("handler stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("handler stopped".into()))
    }
}

/// Configure-time checks, reported into the coordinator's problem map.
pub fn check_problems(config: &HandleConfig) -> HashMap<String, String> {
    let mut problems = HashMap::new();
    match config.system {
        HandleBackend::HomeAutomation => {
            if config.home_automation.url.is_empty() {
                problems.insert(
                    "no url".into(),
                    "handle.home_automation.url is not set in the profile".into(),
                );
            }
        }
        HandleBackend::Command => {
            if which::which(&config.command.program).is_err() {
                problems.insert(
                    "missing program".into(),
                    format!(
                        "handle command '{}' not found on PATH",
                        config.command.program
                    ),
                );
            }
        }
        HandleBackend::Dummy => {}
    }
    problems
}

/// Spawn the intent handler actor.
pub fn spawn(config: HandleConfig) -> HandlerHandle {
    let (tx, mut rx) = mpsc::channel::<HandlerCommand>(8);
    tokio::spawn(async move {
        let handler = IntentHandler::new(config);
        while let Some(HandlerCommand::Handle { intent, reply }) = rx.recv().await {
            let handled = handler.handle(intent).await;
            let _ = reply.send(handled);
        }
        debug!("handler stopped");
    });
    HandlerHandle { tx }
}

/// The dispatch engine.
pub struct IntentHandler {
    config: HandleConfig,
    http: reqwest::Client,
}

impl IntentHandler {
    /// Create a handler for the configured backend.
    pub fn new(config: HandleConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Dispatch one intent; failures are annotated, never propagated.
    pub async fn handle(&self, mut intent: IntentResult) -> IntentResult {
        let outcome = match self.config.system {
            HandleBackend::HomeAutomation => self.send_event(&mut intent).await,
            HandleBackend::Command => self.run_command(&intent).await,
            HandleBackend::Dummy => {
                debug!("discarding intent '{}' (dummy handler)", intent.intent.name);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            error!("dispatch failed: {e}");
            intent.error = Some(e.to_string());
        }
        intent
    }

    async fn send_event(&self, intent: &mut IntentResult) -> Result<()> {
        let ha = &self.config.home_automation;
        let event_type = ha.event_type_format.replace("{intent}", &intent.intent.name);
        let post_url = format!(
            "{}/api/events/{event_type}",
            ha.url.trim_end_matches('/')
        );

        let mut event_data = serde_json::Map::new();
        for entity in &intent.entities {
            event_data.insert(
                entity.entity.clone(),
                serde_json::Value::String(entity.value.clone()),
            );
        }

        // Keep a copy of the event on the intent for debugging.
        intent.event = Some(DispatchedEvent {
            event_type: event_type.clone(),
            event_data: event_data.clone(),
        });

        let mut request = self.http.post(&post_url).json(&event_data);

        // Auth source priority: profile token, environment token, legacy
        // API password.
        if !ha.access_token.is_empty() {
            request = request.bearer_auth(&ha.access_token);
        } else if let Ok(token) = std::env::var(TOKEN_ENV) {
            request = request.bearer_auth(token);
        } else if !ha.api_password.is_empty() {
            request = request.header("X-HA-Access", &ha.api_password);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AssistantError::Dispatch(format!("POST {post_url}: {e}")))?;
        response
            .error_for_status()
            .map_err(|e| AssistantError::Dispatch(e.to_string()))?;

        info!("dispatched event '{event_type}'");
        Ok(())
    }

    async fn run_command(&self, intent: &IntentResult) -> Result<()> {
        let json = serde_json::to_vec(intent)
            .map_err(|e| AssistantError::Dispatch(format!("intent serialize: {e}")))?;

        let mut child = Command::new(&self.config.command.program)
            .args(&self.config.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AssistantError::Dispatch(format!(
                    "cannot spawn '{}': {e}",
                    self.config.command.program
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AssistantError::Dispatch("handle command has no stdin".into()))?;
        stdin
            .write_all(&json)
            .await
            .map_err(|e| AssistantError::Dispatch(format!("stdin write: {e}")))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| AssistantError::Dispatch(format!("wait: {e}")))?;
        if !status.success() {
            return Err(AssistantError::Dispatch(format!(
                "handle command exited with {status}"
            )));
        }
        Ok(())
    }
}
