//! Configuration types and layered profiles.
//!
//! A [`Profile`] is an immutable configuration snapshot: base defaults are
//! merged with the user's `profile.toml` overlay, then deserialized into the
//! typed [`AssistantConfig`] tree. Profiles also own read/write path
//! resolution over an ordered list of profile directories, so runtime
//! artifacts (dictionary, language model, intent FST) are always addressed
//! through the profile rather than by hard-coded paths.

use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable holding a colon-separated profile search path.
///
/// Directories are searched last-first, so later entries take precedence.
pub const PROFILES_ENV: &str = "HARK_PROFILES";

/// Environment variable naming the default profile.
pub const PROFILE_ENV: &str = "HARK_PROFILE";

/// Top-level configuration for the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Deployment language code, used in generated grammar headers and
    /// remote training requests.
    pub language: String,
    /// Automatically start listening for the wake word on boot.
    pub listen_on_start: bool,
    /// Seconds to wait for all components to configure before proceeding.
    pub load_timeout_sec: f32,
    /// Microphone capture settings.
    pub audio: AudioConfig,
    /// Wake-word detection settings.
    pub wake: WakeConfig,
    /// Voice-command listener (VAD bracketing) settings.
    pub command: CommandConfig,
    /// Speech decoder settings.
    pub decode: DecodeConfig,
    /// Intent recognizer settings.
    pub intent: IntentConfig,
    /// Intent handler (dispatch) settings.
    pub handle: HandleConfig,
    /// Feedback chime settings.
    pub sounds: SoundsConfig,
    /// Training pipeline settings.
    pub training: TrainingConfig,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            language: "en".into(),
            listen_on_start: false,
            load_timeout_sec: 30.0,
            audio: AudioConfig::default(),
            wake: WakeConfig::default(),
            command: CommandConfig::default(),
            decode: DecodeConfig::default(),
            intent: IntentConfig::default(),
            handle: HandleConfig::default(),
            sounds: SoundsConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

/// Word casing applied during tokenization and dictionary construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordCasing {
    /// Lowercase every token (the usual choice for CMU-style models).
    #[default]
    Lower,
    /// Uppercase every token.
    Upper,
    /// Leave tokens as written.
    Preserve,
}

impl WordCasing {
    /// Apply this casing rule to a word.
    pub fn apply(self, word: &str) -> String {
        match self {
            Self::Lower => word.to_lowercase(),
            Self::Upper => word.to_uppercase(),
            Self::Preserve => word.to_owned(),
        }
    }
}

/// Microphone capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture backend.
    pub system: MicBackend,
    /// Sample rate in Hz. The pipeline operates at 16 kHz throughout.
    pub sample_rate: u32,
    /// Frame length in milliseconds; must be 10, 20 or 30 (the VAD unit).
    pub frame_ms: u32,
    /// Input device name (None = system default).
    pub device: Option<String>,
    /// Bound on per-subscriber frame queues.
    pub channel_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            system: MicBackend::Cpal,
            sample_rate: 16_000,
            frame_ms: 30,
            device: None,
            channel_capacity: 64,
        }
    }
}

impl AudioConfig {
    /// Samples per frame at the configured rate.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Microphone backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicBackend {
    /// Capture from the system microphone via cpal.
    #[default]
    Cpal,
    /// No capture; frames are injected programmatically.
    Dummy,
}

/// Wake-word detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Detection backend.
    pub system: WakeBackend,
    /// The spoken keyphrase this deployment answers to.
    pub keyphrase: String,
    /// Detection score floor in [0, 1] (spotter backend).
    pub threshold: f32,
    /// Load detector resources at configure time instead of first listen.
    pub preload: bool,
    /// Emit a `WakeNotDetected` event per non-matching chunk (diagnostics).
    pub not_detected: bool,
    /// Preferred chunk size in samples fed to the detector.
    pub chunk_samples: usize,
    /// Directory of reference recordings, relative to the profile.
    pub references_dir: String,
    /// External detector program (command backend).
    pub command: ExternalCommand,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            system: WakeBackend::Spotter,
            keyphrase: String::new(),
            threshold: 0.55,
            preload: false,
            not_detected: false,
            chunk_samples: 480,
            references_dir: "wake".into(),
            command: ExternalCommand::default(),
        }
    }
}

/// Wake detection backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeBackend {
    /// Local template spotter over reference recordings of the keyphrase.
    #[default]
    Spotter,
    /// External program: PCM on stdin, detected keyphrase lines on stdout.
    Command,
    /// Never detects anything.
    Dummy,
}

/// An external program invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalCommand {
    /// Program name or path; resolved against `PATH` when bare.
    pub program: String,
    /// Fixed arguments.
    pub args: Vec<String>,
}

/// Voice-command listener configuration.
///
/// All durations are derived into frame counts at the configured frame size,
/// rounding up, so the bracketing state machine is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// VAD aggressiveness, 0 (permissive) to 3 (strict).
    pub vad_aggressiveness: u8,
    /// Minimum length of a command in seconds.
    pub min_command_sec: f32,
    /// Trailing silence that ends a command, in seconds.
    pub silence_trailing_sec: f32,
    /// Maximum command length in seconds before timing out.
    pub max_command_sec: f32,
    /// Number of initial frames discarded as device noise.
    pub throwaway_frames: usize,
    /// Consecutive speech frames required to start a phrase.
    pub leading_speech_frames: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            vad_aggressiveness: 1,
            min_command_sec: 2.0,
            silence_trailing_sec: 0.5,
            max_command_sec: 30.0,
            throwaway_frames: 10,
            leading_speech_frames: 5,
        }
    }
}

/// Speech decoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Decoder backend.
    pub system: DecodeBackend,
    /// Load decoder artifacts at configure time instead of first transcribe.
    pub preload: bool,
    /// External decoder program: WAV on stdin, transcript on stdout.
    pub command: ExternalCommand,
    /// Remote decoder endpoint (POST audio/wav).
    pub remote_url: String,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            system: DecodeBackend::Dummy,
            preload: false,
            command: ExternalCommand::default(),
            remote_url: String::new(),
        }
    }
}

/// Speech decoder backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeBackend {
    /// External program fed WAV on stdin.
    Command,
    /// Remote HTTP endpoint.
    Remote,
    /// Returns empty transcriptions.
    #[default]
    Dummy,
}

/// Intent recognizer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Recognition strategy.
    pub system: IntentBackend,
    /// FST acceptor settings.
    pub fst: FstIntentConfig,
    /// Fuzzy matcher settings.
    pub fuzzy: FuzzyIntentConfig,
    /// Keyword engine settings.
    pub keyword: KeywordIntentConfig,
    /// Remote recognizer endpoint (POST text).
    pub remote_url: String,
    /// External recognizer program: text on stdin, intent JSON on stdout.
    pub command: ExternalCommand,
    /// What a non-zero exit from the command recognizer means.
    pub command_nonzero_exit: NonzeroExitPolicy,
}

/// Intent recognition backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentBackend {
    /// Accept the transcript against the trained intent FST.
    #[default]
    Fst,
    /// Fuzzy string match against trained example sentences.
    Fuzzy,
    /// Required/optional keyword engine.
    Keyword,
    /// Remote HTTP recognizer.
    Remote,
    /// External recognizer program.
    Command,
    /// Always returns the empty intent.
    Dummy,
}

/// Behaviour when the command recognizer exits non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonzeroExitPolicy {
    /// Treat as a recognition failure (surfaces as the empty intent).
    #[default]
    Empty,
    /// Propagate as an error.
    Error,
}

/// FST acceptor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FstIntentConfig {
    /// Intent FST path, relative to the profile.
    pub intent_fst: String,
    /// Drop transcript tokens that are not in the FST alphabet.
    pub ignore_unknown_words: bool,
    /// Token casing applied before acceptance.
    pub casing: WordCasing,
}

impl Default for FstIntentConfig {
    fn default() -> Self {
        Self {
            intent_fst: "intent.fst".into(),
            ignore_unknown_words: true,
            casing: WordCasing::Lower,
        }
    }
}

/// Fuzzy matcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzyIntentConfig {
    /// Trained examples file, relative to the profile.
    pub examples_json: String,
    /// Minimum similarity in [0, 1] for a match to count.
    pub min_confidence: f32,
}

impl Default for FuzzyIntentConfig {
    fn default() -> Self {
        Self {
            examples_json: "intent_examples.json".into(),
            min_confidence: 0.0,
        }
    }
}

/// Keyword engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordIntentConfig {
    /// Trained keyword config file, relative to the profile.
    pub config_json: String,
}

impl Default for KeywordIntentConfig {
    fn default() -> Self {
        Self {
            config_json: "keyword_intents.json".into(),
        }
    }
}

/// Intent handler configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Dispatch backend.
    pub system: HandleBackend,
    /// Home-automation collaborator settings.
    pub home_automation: HomeAutomationConfig,
    /// External handler program: intent JSON on stdin.
    pub command: ExternalCommand,
}

/// Intent dispatch backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleBackend {
    /// POST events to the home-automation collaborator.
    HomeAutomation,
    /// External handler program.
    Command,
    /// Discard intents.
    #[default]
    Dummy,
}

/// Home-automation event POST settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAutomationConfig {
    /// Base URL of the collaborator, e.g. `http://localhost:8123`.
    pub url: String,
    /// Event type template; `{intent}` is replaced with the intent name.
    pub event_type_format: String,
    /// Access token for `Authorization: Bearer`.
    pub access_token: String,
    /// Legacy API password for the `X-HA-Access` header.
    pub api_password: String,
}

impl Default for HomeAutomationConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            event_type_format: "hark_{intent}".into(),
            access_token: String::new(),
            api_password: String::new(),
        }
    }
}

/// Feedback chime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundsConfig {
    /// Playback backend.
    pub system: SoundBackend,
    /// WAV played when the wake word is detected.
    pub wake: Option<String>,
    /// WAV played when a voice command has been captured.
    pub recorded: Option<String>,
}

impl Default for SoundsConfig {
    fn default() -> Self {
        Self {
            system: SoundBackend::Dummy,
            wake: None,
            recorded: None,
        }
    }
}

/// Chime playback backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundBackend {
    /// Play through the default output device via cpal.
    Cpal,
    /// Discard playback requests.
    #[default]
    Dummy,
}

/// Training pipeline configuration.
///
/// Paths are relative to the profile and resolved through
/// [`Profile::read_path`] / [`Profile::write_path`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Sentence grammar source file.
    pub sentences_file: String,
    /// Directory receiving generated JSGF grammars.
    pub grammars_dir: String,
    /// Directory of slot value files.
    pub slots_dir: String,
    /// Generated run-time pronunciation dictionary.
    pub dictionary: String,
    /// User's custom pronunciations; read first, and appended by G2P.
    pub custom_words: String,
    /// Words with no pronunciation after the dictionary merge.
    pub unknown_words: String,
    /// Generated vocabulary listing.
    pub vocabulary: String,
    /// Generated ARPA language model.
    pub language_model: String,
    /// Base (pre-built) pronunciation dictionary.
    pub base_dictionary: String,
    /// Base ARPA language model for mixing.
    pub base_language_model: String,
    /// Base LM interpolation weight α in [0, 1]; 0 disables mixing.
    pub mix_weight: f32,
    /// Casing applied to dictionary words and grammar tokens.
    pub casing: WordCasing,
    /// Pronunciation merge rule across dictionary sources.
    pub dictionary_merge_rule: DictionaryMergeRule,
    /// Number duplicate pronunciations `word(2)`, `word(3)`, … on disk.
    pub number_duplicates: bool,
    /// Fail training when words remain unknown after G2P.
    pub fail_on_unknown: bool,
    /// Grapheme-to-phoneme fallback for unknown words.
    pub g2p: G2pConfig,
    /// Phoneme map file translating dictionary phonemes to the speech
    /// engine's alphabet (`from to` per line).
    pub phoneme_map: String,
    /// N-gram order of the generated language model.
    pub lm_order: usize,
    /// Cap on sentences sampled per intent; 0 = exhaustive enumeration.
    pub max_sentences_per_intent: usize,
    /// Delete stale `.gram` files before regenerating grammars.
    pub delete_old_grammars: bool,
    /// Remote intent-trainer endpoint (used by the remote strategy).
    pub remote_trainer_url: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            sentences_file: "sentences.ini".into(),
            grammars_dir: "grammars".into(),
            slots_dir: "slots".into(),
            dictionary: "dictionary.txt".into(),
            custom_words: "custom_words.txt".into(),
            unknown_words: "unknown_words.txt".into(),
            vocabulary: "vocab.txt".into(),
            language_model: "language_model.txt".into(),
            base_dictionary: "base_dictionary.txt".into(),
            base_language_model: "base_language_model.txt".into(),
            mix_weight: 0.0,
            casing: WordCasing::Lower,
            dictionary_merge_rule: DictionaryMergeRule::All,
            number_duplicates: true,
            fail_on_unknown: false,
            g2p: G2pConfig::default(),
            phoneme_map: "phoneme_map.txt".into(),
            lm_order: 3,
            max_sentences_per_intent: 0,
            delete_old_grammars: true,
            remote_trainer_url: String::new(),
        }
    }
}

/// How pronunciations from multiple dictionary sources combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DictionaryMergeRule {
    /// Keep every variant from every source.
    #[default]
    All,
    /// First source that provides a pronunciation wins.
    First,
}

/// Grapheme-to-phoneme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct G2pConfig {
    /// Whether to guess pronunciations for unknown words.
    pub enabled: bool,
    /// G2P model file, relative to the profile.
    pub model: String,
    /// External G2P tool; receives `--model <model> --word_list <file> --nbest 1`.
    pub program: String,
    /// Casing applied to guessed words before writing.
    pub casing: Option<WordCasing>,
}

impl Default for G2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "g2p.fst".into(),
            program: "phonetisaurus-apply".into(),
            casing: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// An immutable configuration snapshot for one deployment.
///
/// Constructed at startup or reload; never mutated afterwards. Retraining
/// produces new artifacts on disk and fresh component instances, not profile
/// mutation.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Profile name (subdirectory under each search dir).
    pub name: String,
    /// Ordered search directories; earlier entries win for reads.
    pub dirs: Vec<PathBuf>,
    /// Merged raw configuration, kept for dotted-path diagnostics.
    raw: toml::Value,
    /// Typed configuration tree.
    pub config: AssistantConfig,
}

impl Profile {
    /// Load a profile by name from the given search directories.
    ///
    /// `defaults.toml` is read from the first directory that has one; the
    /// profile's own `profile.toml` is merged on top.
    ///
    /// # Errors
    ///
    /// Returns a config error when no search directory exists or the merged
    /// configuration fails to deserialize.
    pub fn load(name: &str, dirs: Vec<PathBuf>) -> Result<Self> {
        if dirs.is_empty() {
            return Err(AssistantError::Config("no profile directories".into()));
        }

        let mut raw = toml::Value::Table(toml::map::Map::new());

        for dir in &dirs {
            let defaults_path = dir.join("defaults.toml");
            if defaults_path.is_file() {
                raw = read_toml(&defaults_path)?;
                debug!("loaded defaults from {}", defaults_path.display());
                break;
            }
        }

        for dir in &dirs {
            let overlay_path = dir.join(name).join("profile.toml");
            if overlay_path.is_file() {
                let overlay = read_toml(&overlay_path)?;
                merge_toml(&mut raw, overlay);
                debug!("merged profile overlay {}", overlay_path.display());
                break;
            }
        }

        let config: AssistantConfig = raw
            .clone()
            .try_into()
            .map_err(|e| AssistantError::Config(format!("profile '{name}': {e}")))?;

        Ok(Self {
            name: name.to_owned(),
            dirs,
            raw,
            config,
        })
    }

    /// Load the default profile using the environment and the per-user
    /// profile root.
    ///
    /// # Errors
    ///
    /// Returns a config error when the profile cannot be loaded.
    pub fn load_default() -> Result<Self> {
        let name = std::env::var(PROFILE_ENV).unwrap_or_else(|_| "en".into());
        Self::load(&name, Self::search_dirs())
    }

    /// The ordered profile search path.
    ///
    /// `HARK_PROFILES` entries are searched last-first (later entries take
    /// precedence), followed by the per-user profile root.
    pub fn search_dirs() -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Ok(var) = std::env::var(PROFILES_ENV) {
            for entry in var.split(':').filter(|s| !s.is_empty()) {
                dirs.insert(0, PathBuf::from(entry));
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            dirs.push(config_dir.join("hark").join("profiles"));
        }
        dirs
    }

    /// Look up a raw setting by dotted path, e.g. `"wake.keyphrase"`.
    ///
    /// Intended for diagnostics; typed access goes through
    /// [`Profile::config`].
    pub fn get_raw(&self, dotted: &str) -> Option<&toml::Value> {
        let mut current = &self.raw;
        for part in dotted.split('.') {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    /// Resolve a profile-relative path for reading.
    ///
    /// Returns the first existing match across the search directories, or the
    /// location it would occupy in the first directory when nothing exists
    /// yet (so error messages carry a concrete path).
    pub fn read_path(&self, relative: &str) -> PathBuf {
        for dir in &self.dirs {
            let candidate = dir.join(&self.name).join(relative);
            if candidate.exists() {
                return candidate;
            }
        }
        self.dirs[0].join(&self.name).join(relative)
    }

    /// Resolve a profile-relative path for writing, creating parent
    /// directories in the first writable search directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when no search directory is writable.
    pub fn write_path(&self, relative: &str) -> Result<PathBuf> {
        let mut last_err: Option<std::io::Error> = None;
        for dir in &self.dirs {
            let full = dir.join(&self.name).join(relative);
            let parent = full.parent().unwrap_or(Path::new("."));
            match std::fs::create_dir_all(parent) {
                Ok(()) => return Ok(full),
                Err(e) => {
                    warn!("cannot write under {}: {e}", dir.display());
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(AssistantError::Io)
            .unwrap_or_else(|| AssistantError::Config("no profile directories".into())))
    }

    /// Resolve and create a profile-relative directory for writing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when no search directory is writable.
    pub fn write_dir(&self, relative: &str) -> Result<PathBuf> {
        let mut last_err: Option<std::io::Error> = None;
        for dir in &self.dirs {
            let full = dir.join(&self.name).join(relative);
            match std::fs::create_dir_all(&full) {
                Ok(()) => return Ok(full),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(AssistantError::Io)
            .unwrap_or_else(|| AssistantError::Config("no profile directories".into())))
    }
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let text = std::fs::read_to_string(path)?;
    text.parse::<toml::Value>()
        .map_err(|e| AssistantError::Config(format!("{}: {e}", path.display())))
}

/// Recursively merge `overlay` into `base`; overlay scalars and arrays win.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn overlay_wins_over_defaults() {
        let root = tempfile::tempdir().unwrap();
        write_file(
            &root.path().join("defaults.toml"),
            "listen_on_start = false\n[wake]\nkeyphrase = \"hey hark\"\nthreshold = 0.5\n",
        );
        write_file(
            &root.path().join("en/profile.toml"),
            "[wake]\nthreshold = 0.8\n",
        );

        let profile = Profile::load("en", vec![root.path().to_path_buf()]).unwrap();
        assert_eq!(profile.config.wake.keyphrase, "hey hark");
        assert!((profile.config.wake.threshold - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn dotted_path_lookup() {
        let root = tempfile::tempdir().unwrap();
        write_file(
            &root.path().join("en/profile.toml"),
            "[handle.home_automation]\nurl = \"http://localhost:8123\"\n",
        );

        let profile = Profile::load("en", vec![root.path().to_path_buf()]).unwrap();
        let url = profile
            .get_raw("handle.home_automation.url")
            .and_then(|v| v.as_str())
            .unwrap();
        assert_eq!(url, "http://localhost:8123");
    }

    #[test]
    fn read_path_prefers_earlier_dirs() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_file(&second.path().join("en/dictionary.txt"), "HELLO HH AH L OW\n");

        let profile = Profile::load(
            "en",
            vec![first.path().to_path_buf(), second.path().to_path_buf()],
        )
        .unwrap();

        // Only the second dir has the file.
        assert!(profile.read_path("dictionary.txt").starts_with(second.path()));

        // Once the first dir has it too, the first wins.
        write_file(&first.path().join("en/dictionary.txt"), "HELLO HH EH L OW\n");
        assert!(profile.read_path("dictionary.txt").starts_with(first.path()));
    }

    #[test]
    fn frame_samples_follow_frame_ms() {
        let mut audio = AudioConfig::default();
        audio.frame_ms = 20;
        assert_eq!(audio.frame_samples(), 320);
        audio.frame_ms = 30;
        assert_eq!(audio.frame_samples(), 480);
    }
}
