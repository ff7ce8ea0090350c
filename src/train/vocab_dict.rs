//! Vocabulary and pronunciation dictionary construction.
//!
//! The run-time dictionary is assembled from the intent FST's vocabulary,
//! the wake keyphrase words and (when language-model mixing is enabled) the
//! base dictionary's full vocabulary. Pronunciations come from the user's
//! custom dictionary first, then the base dictionary; words still missing
//! go through the G2P tool, and whatever remains unknown either fails the
//! training run or is reported, per profile.

use crate::config::{DictionaryMergeRule, G2pConfig, WordCasing};
use crate::error::{AssistantError, Result};
use crate::fst::WeightedFst;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use tracing::{debug, info, warn};

/// A pronunciation dictionary: word → ordered pronunciation variants.
pub type PronunciationDict = BTreeMap<String, Vec<String>>;

/// Parse CMU-style dictionary text.
///
/// Lines are `WORD P1 P2 …`; variants carry a `(n)` suffix on the word;
/// blank lines and `#` comments are skipped.
pub fn parse_dict(text: &str) -> PronunciationDict {
    let mut dict = PronunciationDict::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((word, phonemes)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let word = match word.find('(') {
            Some(idx) if idx > 0 => &word[..idx],
            _ => word,
        };
        let phonemes = phonemes.trim();
        if phonemes.is_empty() {
            continue;
        }
        dict.entry(word.to_owned())
            .or_default()
            .push(phonemes.to_owned());
    }
    dict
}

/// Read a dictionary file; a missing file is an empty dictionary.
///
/// # Errors
///
/// Returns an I/O error when the file exists but cannot be read.
pub fn read_dict_file(path: &Path) -> Result<PronunciationDict> {
    if !path.is_file() {
        return Ok(PronunciationDict::new());
    }
    Ok(parse_dict(&std::fs::read_to_string(path)?))
}

/// Collect the vocabulary the run-time dictionary must cover.
///
/// The result is sorted and de-duplicated.
pub fn build_vocabulary(
    fst: &WeightedFst,
    keyphrase: &str,
    base_dict: Option<&PronunciationDict>,
    casing: WordCasing,
) -> Vec<String> {
    let mut words = fst.input_vocabulary();
    for word in keyphrase.split_whitespace() {
        words.push(casing.apply(word));
    }
    if let Some(base) = base_dict {
        words.extend(base.keys().cloned());
    }
    words.sort();
    words.dedup();
    words
}

/// The result of a dictionary merge.
#[derive(Debug, Default)]
pub struct DictionaryOutcome {
    /// The dictionary text, one line per pronunciation.
    pub text: String,
    /// Vocabulary words with no pronunciation in any source.
    pub unknown: Vec<String>,
}

/// Build the run-time dictionary for `vocabulary` from ordered sources.
///
/// Earlier sources take precedence: under the `first` merge rule the first
/// source providing a pronunciation wins outright; under `all`, variants
/// from every source are kept in source order. On-disk variant numbering is
/// `word(2)`, `word(3)`, … when enabled.
pub fn make_dictionary(
    vocabulary: &[String],
    sources: &[PronunciationDict],
    merge_rule: DictionaryMergeRule,
    number_duplicates: bool,
) -> DictionaryOutcome {
    let mut outcome = DictionaryOutcome::default();

    for word in vocabulary {
        let mut pronunciations: Vec<String> = Vec::new();
        for source in sources {
            if let Some(variants) = source.get(word) {
                match merge_rule {
                    DictionaryMergeRule::First => {
                        pronunciations = variants.clone();
                        break;
                    }
                    DictionaryMergeRule::All => {
                        pronunciations.extend(variants.iter().cloned());
                    }
                }
            }
        }
        pronunciations.dedup();

        if pronunciations.is_empty() {
            outcome.unknown.push(word.clone());
            continue;
        }

        for (index, phonemes) in pronunciations.iter().enumerate() {
            if index == 0 || !number_duplicates {
                outcome.text.push_str(&format!("{word} {phonemes}\n"));
            } else {
                outcome
                    .text
                    .push_str(&format!("{word}({}) {phonemes}\n", index + 1));
            }
        }
    }

    if !outcome.unknown.is_empty() {
        warn!("{} unknown word(s)", outcome.unknown.len());
    }
    outcome
}

/// Guess pronunciations for unknown words with the configured G2P tool.
///
/// Returns `(word, phonemes)` pairs, one best guess per word, in input
/// order. The word list is passed through a scoped temporary file that is
/// removed on every exit path.
///
/// # Errors
///
/// Returns a training error when the tool is unavailable or fails.
pub fn guess_pronunciations(
    g2p: &G2pConfig,
    model_path: &Path,
    unknown: &[String],
    fallback_casing: WordCasing,
) -> Result<Vec<(String, String)>> {
    if unknown.is_empty() {
        return Ok(Vec::new());
    }

    let program = which::which(&g2p.program).map_err(|_| {
        AssistantError::Training(format!("G2P tool '{}' not found on PATH", g2p.program))
    })?;

    let mut word_list = tempfile::NamedTempFile::new()?;
    for word in unknown {
        writeln!(word_list, "{word}")?;
    }
    word_list.flush()?;

    debug!("guessing pronunciations for {} word(s)", unknown.len());
    let output = std::process::Command::new(&program)
        .arg("--model")
        .arg(model_path)
        .arg("--word_list")
        .arg(word_list.path())
        .arg("--nbest")
        .arg("1")
        .output()
        .map_err(|e| AssistantError::Training(format!("G2P failed to start: {e}")))?;

    if !output.status.success() {
        return Err(AssistantError::Training(format!(
            "G2P exited with {}",
            output.status
        )));
    }

    let casing = g2p.casing.unwrap_or(fallback_casing);
    let mut guesses = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((word, phonemes)) = line.split_once(char::is_whitespace) {
            guesses.push((casing.apply(word), phonemes.trim().to_owned()));
        }
    }

    info!("G2P produced {} pronunciation(s)", guesses.len());
    Ok(guesses)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_DICT: &str = "\
# comment line
HELLO HH AH L OW
HELLO(2) HH EH L OW
LIGHT L AY T
TURN T ER N
";

    #[test]
    fn variants_collapse_onto_one_word() {
        let dict = parse_dict(BASE_DICT);
        assert_eq!(dict["HELLO"].len(), 2);
        assert_eq!(dict["LIGHT"], vec!["L AY T"]);
    }

    #[test]
    fn first_merge_rule_prefers_custom_source() {
        let custom = parse_dict("LIGHT L IY T\n");
        let base = parse_dict(BASE_DICT);
        let vocabulary = vec!["LIGHT".to_owned()];

        let outcome = make_dictionary(
            &vocabulary,
            &[custom, base],
            DictionaryMergeRule::First,
            true,
        );
        assert_eq!(outcome.text, "LIGHT L IY T\n");
        assert!(outcome.unknown.is_empty());
    }

    #[test]
    fn all_merge_rule_numbers_duplicates() {
        let custom = parse_dict("LIGHT L IY T\n");
        let base = parse_dict(BASE_DICT);
        let vocabulary = vec!["LIGHT".to_owned()];

        let outcome =
            make_dictionary(&vocabulary, &[custom, base], DictionaryMergeRule::All, true);
        assert_eq!(outcome.text, "LIGHT L IY T\nLIGHT(2) L AY T\n");
    }

    #[test]
    fn missing_words_are_reported_unknown() {
        let base = parse_dict(BASE_DICT);
        let vocabulary = vec![
            "LIGHT".to_owned(),
            "RAXACORICOFALLAPATORIUS".to_owned(),
        ];

        let outcome =
            make_dictionary(&vocabulary, &[base], DictionaryMergeRule::All, true);
        assert_eq!(outcome.unknown, vec!["RAXACORICOFALLAPATORIUS"]);
        assert!(outcome.text.contains("LIGHT"));
    }

    #[test]
    fn vocabulary_includes_keyphrase_and_base_words() {
        use crate::fst::FstArc;

        let mut fst = WeightedFst::new();
        let s1 = fst.add_state();
        let word = fst.input_symbols.intern("light");
        fst.add_arc(
            0,
            FstArc {
                ilabel: word,
                olabel: word,
                weight: 0.0,
                next_state: s1,
            },
        );
        fst.set_final(s1, 0.0);

        let base = parse_dict("extra E K S T R AH\n");
        let vocab = build_vocabulary(&fst, "hey hark", Some(&base), WordCasing::Lower);
        assert_eq!(vocab, vec!["extra", "hark", "hey", "light"]);
    }

    #[test]
    fn missing_dict_file_is_empty() {
        let dict = read_dict_file(Path::new("/nonexistent/dictionary.txt")).unwrap();
        assert!(dict.is_empty());
    }
}
