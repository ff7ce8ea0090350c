//! Word pronunciation lookups.
//!
//! Answers the out-of-band "how is this word pronounced" request: known
//! words come from the custom and base dictionaries, unknown words get up
//! to `n` G2P guesses. A phoneme map file (`from to` per line, `#`
//! comments) optionally translates dictionary phonemes into a
//! target-engine alphabet for display.

use crate::config::{G2pConfig, Profile, WordCasing};
use crate::error::{AssistantError, Result};
use crate::train::vocab_dict::{PronunciationDict, read_dict_file};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Pronunciations for one requested word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordPronunciation {
    /// Whether the word was found in a dictionary (vs guessed).
    pub in_dictionary: bool,
    /// Pronunciations, dictionary order or best-first for guesses.
    pub pronunciations: Vec<String>,
    /// The same pronunciations translated through the profile's phoneme
    /// map, parallel to `pronunciations`; empty when no map file exists.
    pub phonemes: Vec<String>,
}

enum PronounceCommand {
    Lookup {
        words: Vec<String>,
        n: usize,
        reply: oneshot::Sender<Result<BTreeMap<String, WordPronunciation>>>,
    },
}

/// Handle to the pronunciation service actor.
#[derive(Clone)]
pub struct PronounceHandle {
    tx: mpsc::Sender<PronounceCommand>,
}

impl PronounceHandle {
    /// Look up pronunciations for `words`, guessing up to `n` variants for
    /// words no dictionary knows.
    ///
    /// # Errors
    ///
    /// Returns lookup errors (unreadable dictionary, failing G2P tool) or a
    /// channel error when the service has stopped.
    pub async fn lookup(
        &self,
        words: Vec<String>,
        n: usize,
    ) -> Result<BTreeMap<String, WordPronunciation>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PronounceCommand::Lookup { words, n, reply })
            .await
            .map_err(|_| AssistantError::Channel("pronounce service stopped".into()))?;
        rx.await
            .map_err(|_| AssistantError::Channel("pronounce service stopped".into()))?
    }
}

/// Spawn the pronunciation service actor.
pub fn spawn(profile: &Profile) -> PronounceHandle {
    let service = PronounceService::from_profile(profile);
    let (tx, mut rx) = mpsc::channel::<PronounceCommand>(8);
    tokio::spawn(async move {
        while let Some(PronounceCommand::Lookup { words, n, reply }) = rx.recv().await {
            // Dictionary reads and the G2P subprocess are blocking.
            let service = service.clone();
            let result =
                tokio::task::spawn_blocking(move || service.lookup(&words, n)).await;
            let _ = reply.send(result.unwrap_or_else(|e| {
                Err(AssistantError::Channel(format!("lookup task failed: {e}")))
            }));
        }
    });
    PronounceHandle { tx }
}

/// The lookup engine.
#[derive(Clone)]
pub struct PronounceService {
    custom_words: PathBuf,
    base_dictionary: PathBuf,
    g2p: G2pConfig,
    g2p_model: PathBuf,
    phoneme_map: PathBuf,
    casing: WordCasing,
}

impl PronounceService {
    /// Build a service over a profile's dictionary and G2P settings.
    pub fn from_profile(profile: &Profile) -> Self {
        let training = &profile.config.training;
        Self {
            custom_words: profile.read_path(&training.custom_words),
            base_dictionary: profile.read_path(&training.base_dictionary),
            g2p: training.g2p.clone(),
            g2p_model: profile.read_path(&training.g2p.model),
            phoneme_map: profile.read_path(&training.phoneme_map),
            casing: training.casing,
        }
    }

    /// Look up each word; unknown words get up to `n` G2P guesses.
    ///
    /// # Errors
    ///
    /// Returns dictionary or G2P errors.
    pub fn lookup(
        &self,
        words: &[String],
        n: usize,
    ) -> Result<BTreeMap<String, WordPronunciation>> {
        let custom = read_dict_file(&self.custom_words)?;
        let base = read_dict_file(&self.base_dictionary)?;
        let phoneme_map = if self.phoneme_map.is_file() {
            parse_phoneme_map(&std::fs::read_to_string(&self.phoneme_map)?)
        } else {
            BTreeMap::new()
        };

        let mut results = BTreeMap::new();
        let mut unknown = Vec::new();
        for word in words {
            let cased = self.casing.apply(word);
            let mut pronunciations = Vec::new();
            for source in [&custom, &base] {
                if let Some(variants) = source.get(&cased) {
                    pronunciations.extend(variants.iter().cloned());
                }
            }
            pronunciations.dedup();
            if pronunciations.is_empty() {
                unknown.push(cased.clone());
            } else {
                results.insert(
                    cased,
                    word_pronunciation(true, pronunciations, &phoneme_map),
                );
            }
        }

        if !unknown.is_empty() && n > 0 && self.g2p.enabled && self.g2p_model.is_file() {
            for (word, guesses) in self.guess(&unknown, n)? {
                results.insert(word, word_pronunciation(false, guesses, &phoneme_map));
            }
        }
        for word in unknown {
            results.entry(word).or_insert_with(|| WordPronunciation {
                in_dictionary: false,
                pronunciations: Vec::new(),
                phonemes: Vec::new(),
            });
        }

        Ok(results)
    }

    fn guess(&self, words: &[String], n: usize) -> Result<BTreeMap<String, Vec<String>>> {
        let program = which::which(&self.g2p.program).map_err(|_| {
            AssistantError::Training(format!(
                "G2P tool '{}' not found on PATH",
                self.g2p.program
            ))
        })?;

        let mut word_list = tempfile::NamedTempFile::new()?;
        for word in words {
            writeln!(word_list, "{word}")?;
        }
        word_list.flush()?;

        debug!("guessing {} pronunciation(s) per word for {} word(s)", n, words.len());
        let output = std::process::Command::new(&program)
            .arg("--model")
            .arg(&self.g2p_model)
            .arg("--word_list")
            .arg(word_list.path())
            .arg("--nbest")
            .arg(n.to_string())
            .output()
            .map_err(|e| AssistantError::Training(format!("G2P failed to start: {e}")))?;
        if !output.status.success() {
            return Err(AssistantError::Training(format!(
                "G2P exited with {}",
                output.status
            )));
        }

        let mut guesses: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some((word, phonemes)) = line.trim().split_once(char::is_whitespace) {
                guesses
                    .entry(self.casing.apply(word))
                    .or_default()
                    .push(phonemes.trim().to_owned());
            }
        }
        Ok(guesses)
    }
}

fn word_pronunciation(
    in_dictionary: bool,
    pronunciations: Vec<String>,
    phoneme_map: &BTreeMap<String, String>,
) -> WordPronunciation {
    let phonemes = if phoneme_map.is_empty() {
        Vec::new()
    } else {
        pronunciations
            .iter()
            .map(|p| map_phonemes(p, phoneme_map))
            .collect()
    };
    WordPronunciation {
        in_dictionary,
        pronunciations,
        phonemes,
    }
}

/// Parse a phoneme map: `from to` per line, `#` comments.
pub fn parse_phoneme_map(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((from, to)) = line.split_once(char::is_whitespace) {
            map.insert(from.to_owned(), to.trim().to_owned());
        }
    }
    map
}

/// Translate a pronunciation through a phoneme map; unmapped phonemes pass
/// through unchanged.
pub fn map_phonemes(pronunciation: &str, map: &BTreeMap<String, String>) -> String {
    pronunciation
        .split_whitespace()
        .map(|p| map.get(p).map(String::as_str).unwrap_or(p))
        .collect::<Vec<_>>()
        .join(" ")
}
