//! Intent recognition: transcript in, structured intent out.
//!
//! Every strategy honours the same contract: confidence normalised to
//! [0, 1], the transcript's speech confidence copied through, and failures
//! surfacing as the empty intent rather than an error. The strategy choice
//! is configuration; artifacts are produced by the training pipeline.

use crate::config::{IntentBackend, IntentConfig, NonzeroExitPolicy};
use crate::error::{AssistantError, Result};
use crate::fst::{WeightedFst, decode_output_symbols};
use crate::pipeline::messages::{Entity, IntentRef, IntentResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// One training example, as written by the intent trainer and read back by
/// the fuzzy strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedExample {
    /// The sentence text.
    pub text: String,
    /// Entities with spans into `text`.
    pub entities: Vec<Entity>,
    /// The sentence split into tokens.
    pub tokens: Vec<String>,
}

/// The keyword engine's trained configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordModel {
    /// Per-intent required/optional entity-group names.
    pub intents: HashMap<String, KeywordIntent>,
    /// Entity-group name → accepted values. Group names are prefixed
    /// `"<intent>."` for slot entities.
    pub entities: HashMap<String, Vec<String>>,
}

/// Required and optional entity groups for one intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordIntent {
    /// Groups that must all match for the intent to be considered.
    pub require: Vec<String>,
    /// Groups that raise confidence when they match.
    pub optionally: Vec<String>,
}

/// Paths the recognizer resolves at spawn time from the profile.
#[derive(Debug, Clone)]
pub struct RecognizerPaths {
    /// The trained intent FST.
    pub intent_fst: PathBuf,
    /// Fuzzy example sentences.
    pub examples_json: PathBuf,
    /// Keyword engine configuration.
    pub keyword_json: PathBuf,
}

enum RecognizerCommand {
    Recognize {
        text: String,
        speech_confidence: f32,
        reply: oneshot::Sender<IntentResult>,
    },
}

/// Handle to the intent recognizer actor.
#[derive(Clone)]
pub struct RecognizerHandle {
    tx: mpsc::Sender<RecognizerCommand>,
}

impl RecognizerHandle {
    /// Recognize a transcript; failures come back as the empty intent.
    ///
    /// # Errors
    ///
    /// Returns a channel error only when the recognizer actor has stopped.
    pub async fn recognize(&self, text: &str, speech_confidence: f32) -> Result<IntentResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecognizerCommand::Recognize {
                text: text.to_owned(),
                speech_confidence,
                reply,
            })
            .await
            .map_err(|_| AssistantError::Channel("recognizer stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("recognizer stopped".into()))
    }
}

/// Configure-time checks, reported into the coordinator's problem map.
pub fn check_problems(config: &IntentConfig, paths: &RecognizerPaths) -> HashMap<String, String> {
    let mut problems = HashMap::new();
    match config.system {
        IntentBackend::Fst => {
            if !paths.intent_fst.is_file() {
                problems.insert(
                    "missing intent FST".into(),
                    format!(
                        "intent FST not found at {}; train the profile first",
                        paths.intent_fst.display()
                    ),
                );
            }
        }
        IntentBackend::Fuzzy => {
            if !paths.examples_json.is_file() {
                problems.insert(
                    "missing examples".into(),
                    format!(
                        "intent examples not found at {}; train the profile first",
                        paths.examples_json.display()
                    ),
                );
            }
        }
        IntentBackend::Keyword => {
            if !paths.keyword_json.is_file() {
                problems.insert(
                    "missing keyword config".into(),
                    format!(
                        "keyword config not found at {}; train the profile first",
                        paths.keyword_json.display()
                    ),
                );
            }
        }
        IntentBackend::Remote => {
            if config.remote_url.is_empty() {
                problems.insert(
                    "no url".into(),
                    "intent.remote_url is not set in the profile".into(),
                );
            }
        }
        IntentBackend::Command => {
            if config.command.program.is_empty() {
                problems.insert(
                    "no program".into(),
                    "intent.command.program is not set in the profile".into(),
                );
            } else if which::which(&config.command.program).is_err() {
                problems.insert(
                    "missing program".into(),
                    format!(
                        "intent command '{}' not found on PATH",
                        config.command.program
                    ),
                );
            }
        }
        IntentBackend::Dummy => {}
    }
    problems
}

/// Spawn the intent recognizer actor.
pub fn spawn(config: IntentConfig, paths: RecognizerPaths) -> RecognizerHandle {
    let (tx, mut rx) = mpsc::channel::<RecognizerCommand>(8);
    tokio::spawn(async move {
        let mut recognizer = IntentRecognizer::new(config, paths);
        while let Some(RecognizerCommand::Recognize {
            text,
            speech_confidence,
            reply,
        }) = rx.recv().await
        {
            let result = recognizer.recognize(&text, speech_confidence).await;
            let _ = reply.send(result);
        }
        debug!("recognizer stopped");
    });
    RecognizerHandle { tx }
}

/// The recognition engine; caches trained artifacts after first use.
pub struct IntentRecognizer {
    config: IntentConfig,
    paths: RecognizerPaths,
    fst: Option<WeightedFst>,
    examples: Option<HashMap<String, Vec<TrainedExample>>>,
    keywords: Option<KeywordModel>,
    http: reqwest::Client,
}

impl IntentRecognizer {
    /// Create a recognizer for the configured strategy.
    pub fn new(config: IntentConfig, paths: RecognizerPaths) -> Self {
        Self {
            config,
            paths,
            fst: None,
            examples: None,
            keywords: None,
            http: reqwest::Client::new(),
        }
    }

    /// Recognize a transcript. The result is never an error: recognition
    /// failures collapse to the empty intent with confidence 0.
    pub async fn recognize(&mut self, text: &str, speech_confidence: f32) -> IntentResult {
        let outcome = match self.config.system {
            IntentBackend::Fst => self.recognize_fst(text),
            IntentBackend::Fuzzy => self.recognize_fuzzy(text),
            IntentBackend::Keyword => self.recognize_keyword(text),
            IntentBackend::Remote => self.recognize_remote(text).await,
            IntentBackend::Command => self.recognize_command(text).await,
            IntentBackend::Dummy => Ok(IntentResult::empty(text)),
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!("recognition failed: {e}");
                IntentResult::empty(text)
            }
        };

        result.raw_text = text.to_owned();
        result.speech_confidence = speech_confidence;
        result.intent.confidence = result.intent.confidence.clamp(0.0, 1.0);
        if !result.is_empty() {
            info!(
                "recognized intent '{}' (confidence={:.2})",
                result.intent.name, result.intent.confidence
            );
        }
        result
    }

    // -- FST acceptor --------------------------------------------------------

    fn recognize_fst(&mut self, text: &str) -> Result<IntentResult> {
        if self.fst.is_none() {
            self.fst = Some(WeightedFst::load(&self.paths.intent_fst)?);
        }
        let fst = self.fst.as_ref().ok_or_else(|| {
            AssistantError::Recognize("intent FST unavailable".into())
        })?;

        let cased = self.config.fst.casing.apply(text);
        let mut tokens: Vec<&str> = cased.split_whitespace().collect();
        if self.config.fst.ignore_unknown_words {
            tokens.retain(|t| fst.input_symbols.id(t).is_some());
        }
        if tokens.is_empty() {
            return Ok(IntentResult::empty(text));
        }

        match fst.accept(&tokens) {
            Some(path) => {
                let decoded = decode_output_symbols(&path.olabels);
                if decoded.intent_name.is_empty() {
                    return Ok(IntentResult::empty(text));
                }
                Ok(IntentResult {
                    text: decoded.text,
                    intent: IntentRef {
                        name: decoded.intent_name,
                        confidence: 1.0,
                    },
                    entities: decoded.entities,
                    ..IntentResult::default()
                })
            }
            None => {
                debug!("no FST path accepts: {text}");
                Ok(IntentResult::empty(text))
            }
        }
    }

    // -- Fuzzy string match --------------------------------------------------

    fn recognize_fuzzy(&mut self, text: &str) -> Result<IntentResult> {
        if self.examples.is_none() {
            let raw = std::fs::read_to_string(&self.paths.examples_json).map_err(|e| {
                AssistantError::Recognize(format!(
                    "cannot read {}: {e}",
                    self.paths.examples_json.display()
                ))
            })?;
            self.examples = Some(serde_json::from_str(&raw).map_err(|e| {
                AssistantError::Recognize(format!("bad examples JSON: {e}"))
            })?);
        }
        let examples = self.examples.as_ref().ok_or_else(|| {
            AssistantError::Recognize("examples unavailable".into())
        })?;

        if text.trim().is_empty() {
            return Ok(IntentResult::empty(text));
        }

        let needle = text.to_lowercase();
        let mut best: Option<(f32, &str, &TrainedExample)> = None;
        for (intent_name, intent_examples) in examples {
            for example in intent_examples {
                let ratio = similarity(&needle, &example.text.to_lowercase());
                if best.is_none_or(|(score, _, _)| ratio > score) {
                    best = Some((ratio, intent_name, example));
                }
            }
        }

        match best {
            Some((confidence, intent_name, example))
                if confidence >= self.config.fuzzy.min_confidence =>
            {
                Ok(IntentResult {
                    text: example.text.clone(),
                    intent: IntentRef {
                        name: intent_name.to_owned(),
                        confidence,
                    },
                    entities: example.entities.clone(),
                    ..IntentResult::default()
                })
            }
            Some((confidence, _, _)) => {
                warn!(
                    "best fuzzy match below threshold: {confidence:.2} < {:.2}",
                    self.config.fuzzy.min_confidence
                );
                let mut result = IntentResult::empty(text);
                result.intent.confidence = confidence;
                Ok(result)
            }
            None => Ok(IntentResult::empty(text)),
        }
    }

    // -- Keyword engine ------------------------------------------------------

    fn recognize_keyword(&mut self, text: &str) -> Result<IntentResult> {
        if self.keywords.is_none() {
            let raw = std::fs::read_to_string(&self.paths.keyword_json).map_err(|e| {
                AssistantError::Recognize(format!(
                    "cannot read {}: {e}",
                    self.paths.keyword_json.display()
                ))
            })?;
            self.keywords = Some(serde_json::from_str(&raw).map_err(|e| {
                AssistantError::Recognize(format!("bad keyword JSON: {e}"))
            })?);
        }
        let model = self.keywords.as_ref().ok_or_else(|| {
            AssistantError::Recognize("keyword model unavailable".into())
        })?;

        let lowered = text.to_lowercase();
        let mut best: Option<(f32, String, Vec<Entity>)> = None;

        let mut intent_names: Vec<&String> = model.intents.keys().collect();
        intent_names.sort();

        for intent_name in intent_names {
            let intent = &model.intents[intent_name];
            let mut matched = 0usize;
            let mut entities = Vec::new();
            let mut required_ok = true;

            for group in &intent.require {
                match match_group(model, group, &lowered) {
                    Some(value) => {
                        matched += 1;
                        push_slot_entity(&mut entities, intent_name, group, value);
                    }
                    None => {
                        required_ok = false;
                        break;
                    }
                }
            }
            if !required_ok {
                continue;
            }
            for group in &intent.optionally {
                if let Some(value) = match_group(model, group, &lowered) {
                    matched += 1;
                    push_slot_entity(&mut entities, intent_name, group, value);
                }
            }

            let total = intent.require.len() + intent.optionally.len();
            let confidence = if total == 0 {
                0.0
            } else {
                matched as f32 / total as f32
            };
            if best.as_ref().is_none_or(|(score, _, _)| confidence > *score) {
                best = Some((confidence, intent_name.clone(), entities));
            }
        }

        match best {
            Some((confidence, name, entities)) if confidence > 0.0 => Ok(IntentResult {
                text: text.to_owned(),
                intent: IntentRef { name, confidence },
                entities,
                ..IntentResult::default()
            }),
            _ => Ok(IntentResult::empty(text)),
        }
    }

    // -- Remote HTTP ---------------------------------------------------------

    async fn recognize_remote(&self, text: &str) -> Result<IntentResult> {
        let response = self
            .http
            .post(&self.config.remote_url)
            .header("Content-Type", "text/plain")
            .body(text.to_owned())
            .send()
            .await
            .map_err(|e| {
                AssistantError::Recognize(format!("POST {}: {e}", self.config.remote_url))
            })?
            .error_for_status()
            .map_err(|e| AssistantError::Recognize(e.to_string()))?;

        response
            .json::<IntentResult>()
            .await
            .map_err(|e| AssistantError::Recognize(format!("bad intent JSON: {e}")))
    }

    // -- Command subprocess --------------------------------------------------

    async fn recognize_command(&self, text: &str) -> Result<IntentResult> {
        let mut child = Command::new(&self.config.command.program)
            .args(&self.config.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AssistantError::Recognize(format!(
                    "cannot spawn '{}': {e}",
                    self.config.command.program
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AssistantError::Recognize("intent command has no stdin".into()))?;
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| AssistantError::Recognize(format!("stdin write: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AssistantError::Recognize(format!("wait: {e}")))?;

        if !output.status.success() {
            match self.config.command_nonzero_exit {
                NonzeroExitPolicy::Empty => {
                    warn!("intent command exited with {}", output.status);
                    return Ok(IntentResult::empty(text));
                }
                NonzeroExitPolicy::Error => {
                    return Err(AssistantError::Recognize(format!(
                        "intent command exited with {}",
                        output.status
                    )));
                }
            }
        }

        serde_json::from_slice::<IntentResult>(&output.stdout)
            .map_err(|e| AssistantError::Recognize(format!("bad intent JSON: {e}")))
    }
}

/// Find the first value of an entity group present in the lowered text.
fn match_group<'a>(model: &'a KeywordModel, group: &str, lowered: &str) -> Option<&'a str> {
    let values = model.entities.get(group)?;
    values
        .iter()
        .find(|value| contains_phrase(lowered, &value.to_lowercase()))
        .map(String::as_str)
}

/// Whole-token phrase containment.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let tokens: Vec<&str> = haystack.split_whitespace().collect();
    let needle: Vec<&str> = phrase.split_whitespace().collect();
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Map a matched entity group back to a slot entity on the result.
///
/// Groups named `"<intent>.<slot>"` carry slots; the per-intent keyword
/// groups (`…RequiredKeyword` / `…OptionalKeyword`) do not.
fn push_slot_entity(entities: &mut Vec<Entity>, intent_name: &str, group: &str, value: &str) {
    let prefix = format!("{intent_name}.");
    if let Some(slot) = group.strip_prefix(&prefix) {
        entities.push(Entity::new(slot, value));
    }
}

/// Similarity ratio in [0, 1] between two strings.
fn similarity(a: &str, b: &str) -> f32 {
    similar::TextDiff::from_chars(a, b).ratio()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_paths() -> RecognizerPaths {
        RecognizerPaths {
            intent_fst: PathBuf::from("/nonexistent/intent.fst"),
            examples_json: PathBuf::from("/nonexistent/intent_examples.json"),
            keyword_json: PathBuf::from("/nonexistent/keyword_intents.json"),
        }
    }

    #[tokio::test]
    async fn dummy_returns_empty_intent() {
        let config = IntentConfig {
            system: IntentBackend::Dummy,
            ..IntentConfig::default()
        };
        let mut recognizer = IntentRecognizer::new(config, no_paths());
        let result = recognizer.recognize("whatever was said", 0.7).await;
        assert!(result.is_empty());
        assert_eq!(result.raw_text, "whatever was said");
        assert!((result.speech_confidence - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn missing_fst_collapses_to_empty_intent() {
        let config = IntentConfig {
            system: IntentBackend::Fst,
            ..IntentConfig::default()
        };
        let mut recognizer = IntentRecognizer::new(config, no_paths());
        let result = recognizer.recognize("turn on the light", 1.0).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn fuzzy_matches_closest_example() {
        let dir = tempfile::tempdir().unwrap();
        let examples_path = dir.path().join("intent_examples.json");
        let examples = serde_json::json!({
            "ChangeLightState": [
                {"text": "turn on the kitchen light", "entities": [
                    {"entity": "state", "value": "on"},
                    {"entity": "name", "value": "kitchen"}
                ], "tokens": ["turn", "on", "the", "kitchen", "light"]}
            ],
            "GetTime": [
                {"text": "what time is it", "entities": [], "tokens": ["what", "time", "is", "it"]}
            ]
        });
        std::fs::write(&examples_path, examples.to_string()).unwrap();

        let config = IntentConfig {
            system: IntentBackend::Fuzzy,
            ..IntentConfig::default()
        };
        let paths = RecognizerPaths {
            examples_json: examples_path,
            ..no_paths()
        };
        let mut recognizer = IntentRecognizer::new(config, paths);

        let result = recognizer.recognize("turn on the kitchen lights", 1.0).await;
        assert_eq!(result.intent.name, "ChangeLightState");
        assert!(result.intent.confidence > 0.8);
        assert_eq!(result.entities.len(), 2);

        let result = recognizer.recognize("what time is it now", 1.0).await;
        assert_eq!(result.intent.name, "GetTime");
    }

    #[tokio::test]
    async fn fuzzy_below_threshold_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let examples_path = dir.path().join("intent_examples.json");
        let examples = serde_json::json!({
            "GetTime": [
                {"text": "what time is it", "entities": [], "tokens": ["what", "time", "is", "it"]}
            ]
        });
        std::fs::write(&examples_path, examples.to_string()).unwrap();

        let config = IntentConfig {
            system: IntentBackend::Fuzzy,
            fuzzy: crate::config::FuzzyIntentConfig {
                examples_json: "intent_examples.json".into(),
                min_confidence: 0.9,
            },
            ..IntentConfig::default()
        };
        let paths = RecognizerPaths {
            examples_json: examples_path,
            ..no_paths()
        };
        let mut recognizer = IntentRecognizer::new(config, paths);

        let result = recognizer.recognize("play some jazz music", 1.0).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn keyword_engine_maps_slots_back() {
        let dir = tempfile::tempdir().unwrap();
        let keyword_path = dir.path().join("keyword_intents.json");
        let model = serde_json::json!({
            "intents": {
                "ChangeLightState": {
                    "require": ["ChangeLightStateRequiredKeyword", "ChangeLightState.name"],
                    "optionally": ["ChangeLightState.state"]
                }
            },
            "entities": {
                "ChangeLightStateRequiredKeyword": ["light"],
                "ChangeLightState.name": ["kitchen", "bedroom"],
                "ChangeLightState.state": ["on", "off"]
            }
        });
        std::fs::write(&keyword_path, model.to_string()).unwrap();

        let config = IntentConfig {
            system: IntentBackend::Keyword,
            ..IntentConfig::default()
        };
        let paths = RecognizerPaths {
            keyword_json: keyword_path,
            ..no_paths()
        };
        let mut recognizer = IntentRecognizer::new(config, paths);

        let result = recognizer.recognize("turn on the kitchen light", 1.0).await;
        assert_eq!(result.intent.name, "ChangeLightState");
        assert!((result.intent.confidence - 1.0).abs() < 1e-6);
        let names: Vec<&str> = result.entities.iter().map(|e| e.entity.as_str()).collect();
        assert!(names.contains(&"name"));
        assert!(names.contains(&"state"));

        // Required group missing: no intent.
        let result = recognizer.recognize("warm up the oven", 1.0).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn remote_strategy_round_trips_json() {
        use wiremock::matchers::{body_string, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let intent = serde_json::json!({
            "text": "turn on the kitchen light",
            "intent": {"name": "ChangeLightState", "confidence": 0.95},
            "entities": [{"entity": "name", "value": "kitchen"}],
            "raw_text": "turn on the kitchen light",
            "speech_confidence": 0.0
        });
        Mock::given(method("POST"))
            .and(body_string("turn on the kitchen light"))
            .respond_with(ResponseTemplate::new(200).set_body_json(intent))
            .mount(&server)
            .await;

        let config = IntentConfig {
            system: IntentBackend::Remote,
            remote_url: server.uri(),
            ..IntentConfig::default()
        };
        let mut recognizer = IntentRecognizer::new(config, no_paths());
        let result = recognizer.recognize("turn on the kitchen light", 0.8).await;
        assert_eq!(result.intent.name, "ChangeLightState");
        // Speech confidence is overwritten from the request, not the server.
        assert!((result.speech_confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn phrase_containment_is_token_aligned() {
        assert!(contains_phrase("turn on the light", "the light"));
        assert!(!contains_phrase("turn on the lighthouse", "the light"));
    }
}
