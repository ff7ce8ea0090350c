//! The training pipeline.
//!
//! A linear DAG of tasks keyed by output-file freshness: a task reruns only
//! when a declared input is newer than a declared output or an output is
//! missing, so re-invoking training without changes is idempotent and a
//! near-no-op. Each task writes its artifacts deterministically; two runs
//! over the same inputs produce byte-identical files.

pub mod compile;
pub mod grammar;
pub mod intent_trainer;
pub mod jsgf;
pub mod lm;
pub mod vocab_dict;

use crate::config::{IntentBackend, Profile, WakeBackend};
use crate::error::{AssistantError, Result};
use crate::fst::WeightedFst;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// The coarse phases the dialogue coordinator tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    /// Grammar generation and FST compilation.
    Sentences,
    /// Vocabulary, dictionary and language model.
    Speech,
    /// Intent-recognizer artifacts.
    Intent,
}

/// What a training run did.
#[derive(Debug, Default)]
pub struct TrainingReport {
    /// Tasks that ran.
    pub ran: Vec<String>,
    /// Tasks skipped because their outputs were fresh.
    pub skipped: Vec<String>,
}

/// Drives the training pipeline against one profile.
pub struct Trainer {
    profile: Profile,
}

impl Trainer {
    /// Create a trainer over an immutable profile snapshot.
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    /// Run the pipeline. `on_phase` is invoked as each phase begins.
    ///
    /// # Errors
    ///
    /// Returns a training error on the first failing task; previously
    /// written artifacts are left in place.
    pub fn run(&self, mut on_phase: impl FnMut(TrainingPhase)) -> Result<TrainingReport> {
        let mut report = TrainingReport::default();
        let training = &self.profile.config.training;

        let sentences_path = self.profile.read_path(&training.sentences_file);
        let grammars_dir = self.profile.write_dir(&training.grammars_dir)?;
        let slots_dir = self.profile.read_path(&training.slots_dir);
        let intent_fst_path = self
            .profile
            .write_path(&self.profile.config.intent.fst.intent_fst)?;
        let vocab_path = self.profile.write_path(&training.vocabulary)?;
        let dictionary_path = self.profile.write_path(&training.dictionary)?;
        let custom_words_path = self.profile.write_path(&training.custom_words)?;
        let unknown_words_path = self.profile.write_path(&training.unknown_words)?;
        let language_model_path = self.profile.write_path(&training.language_model)?;
        let base_dictionary_path = self.profile.read_path(&training.base_dictionary);
        let base_lm_path = self.profile.read_path(&training.base_language_model);
        let base_lm_cache_path = self
            .profile
            .write_path(&format!("{}.fst", training.base_language_model))?;

        let sentences_text = std::fs::read_to_string(&sentences_path).map_err(|e| {
            AssistantError::Training(format!(
                "cannot read {}: {e}",
                sentences_path.display()
            ))
        })?;
        let intents = grammar::intent_names(&sentences_text);
        if intents.is_empty() {
            return Err(AssistantError::Training(format!(
                "{} defines no intents",
                sentences_path.display()
            )));
        }
        let grammar_paths: Vec<PathBuf> = intents
            .iter()
            .map(|intent| grammars_dir.join(format!("{intent}.gram")))
            .collect();

        // -- Phase: sentences ------------------------------------------------
        on_phase(TrainingPhase::Sentences);

        let language = self.profile.config.language.clone();
        run_task(
            &mut report,
            "grammars",
            &[sentences_path.clone()],
            &grammar_paths,
            || {
                grammar::write_grammars(
                    &sentences_text,
                    &grammars_dir,
                    &language,
                    training.delete_old_grammars,
                )?;
                Ok(())
            },
        )?;

        // Parse grammars up front: the FST task's freshness depends on the
        // slot files they reference.
        let mut grammars = Vec::with_capacity(grammar_paths.len());
        for path in &grammar_paths {
            let text = std::fs::read_to_string(path)?;
            grammars.push(jsgf::parse_grammar(&text).map_err(|e| {
                AssistantError::Training(format!("{}: {e}", path.display()))
            })?);
        }
        let mut slot_names: Vec<String> = Vec::new();
        for parsed in &grammars {
            for expr in parsed.rules.values() {
                compile::referenced_slots(expr, &mut slot_names);
            }
        }
        let mut fst_deps = grammar_paths.clone();
        for slot in &slot_names {
            fst_deps.push(slots_dir.join(slot));
        }

        let casing = training.casing;
        run_task(
            &mut report,
            "intent_fst",
            &fst_deps,
            std::slice::from_ref(&intent_fst_path),
            || {
                let slots = compile::load_slots(&slots_dir)?;
                for slot in &slot_names {
                    if !slots.contains_key(slot) {
                        return Err(AssistantError::Training(format!(
                            "missing slot file for ${slot} under {}",
                            slots_dir.display()
                        )));
                    }
                }
                let fst = compile::compile_intent_fst(&grammars, &slots, casing)?;
                fst.save(&intent_fst_path)?;
                Ok(())
            },
        )?;

        // -- Phase: speech ---------------------------------------------------
        on_phase(TrainingPhase::Speech);

        let mixing = training.mix_weight > 0.0;
        let keyphrase = if self.profile.config.wake.system == WakeBackend::Spotter {
            self.profile.config.wake.keyphrase.clone()
        } else {
            String::new()
        };

        let mut vocab_deps = vec![intent_fst_path.clone()];
        if mixing {
            vocab_deps.push(base_dictionary_path.clone());
        }
        run_task(
            &mut report,
            "vocabulary",
            &vocab_deps,
            std::slice::from_ref(&vocab_path),
            || {
                let fst = WeightedFst::load(&intent_fst_path)?;
                let base_dict = if mixing {
                    Some(vocab_dict::read_dict_file(&base_dictionary_path)?)
                } else {
                    None
                };
                let vocabulary = vocab_dict::build_vocabulary(
                    &fst,
                    &keyphrase,
                    base_dict.as_ref(),
                    casing,
                );
                let mut text = String::new();
                for word in &vocabulary {
                    text.push_str(word);
                    text.push('\n');
                }
                std::fs::write(&vocab_path, text)?;
                Ok(())
            },
        )?;

        let mut dict_deps = vec![vocab_path.clone()];
        for source in [&custom_words_path, &base_dictionary_path] {
            if source.is_file() {
                dict_deps.push(source.clone());
            }
        }
        let g2p_model_path = self.profile.read_path(&training.g2p.model);
        run_task(
            &mut report,
            "dictionary",
            &dict_deps,
            std::slice::from_ref(&dictionary_path),
            || {
                let vocabulary: Vec<String> = std::fs::read_to_string(&vocab_path)?
                    .lines()
                    .map(str::to_owned)
                    .filter(|l| !l.is_empty())
                    .collect();
                // Custom dictionary first so the `first` merge rule prefers
                // the user's pronunciations.
                let sources = vec![
                    vocab_dict::read_dict_file(&custom_words_path)?,
                    vocab_dict::read_dict_file(&base_dictionary_path)?,
                ];
                let mut outcome = vocab_dict::make_dictionary(
                    &vocabulary,
                    &sources,
                    training.dictionary_merge_rule,
                    training.number_duplicates,
                );

                if !outcome.unknown.is_empty()
                    && training.g2p.enabled
                    && g2p_model_path.is_file()
                {
                    let guesses = vocab_dict::guess_pronunciations(
                        &training.g2p,
                        &g2p_model_path,
                        &outcome.unknown,
                        casing,
                    )?;
                    let mut guessed: BTreeSet<String> = BTreeSet::new();
                    let mut custom_append = String::new();
                    for (word, phonemes) in &guesses {
                        outcome.text.push_str(&format!("{word} {phonemes}\n"));
                        custom_append.push_str(&format!("{word} {phonemes}\n"));
                        guessed.insert(word.clone());
                    }
                    if !custom_append.is_empty() {
                        append_file(&custom_words_path, &custom_append)?;
                    }
                    // Guessed words are persisted for review; the rest stay
                    // unknown.
                    std::fs::write(
                        &unknown_words_path,
                        join_lines(guesses.iter().map(|(w, p)| format!("{w} {p}"))),
                    )?;
                    outcome
                        .unknown
                        .retain(|word| !guessed.contains(&casing.apply(word)));
                } else {
                    std::fs::write(
                        &unknown_words_path,
                        join_lines(outcome.unknown.iter().cloned()),
                    )?;
                }

                if !outcome.unknown.is_empty() && training.fail_on_unknown {
                    return Err(AssistantError::Training(format!(
                        "unknown words: {}",
                        outcome.unknown.join(", ")
                    )));
                }

                std::fs::write(&dictionary_path, outcome.text)?;
                Ok(())
            },
        )?;

        if mixing {
            run_task(
                &mut report,
                "base_lm_cache",
                std::slice::from_ref(&base_lm_path),
                std::slice::from_ref(&base_lm_cache_path),
                || {
                    let base = lm::NgramModel::from_arpa(&std::fs::read_to_string(
                        &base_lm_path,
                    )?)?;
                    std::fs::write(&base_lm_cache_path, base.to_arpa())?;
                    Ok(())
                },
            )?;
        }

        let mut lm_deps = vec![intent_fst_path.clone()];
        if mixing {
            lm_deps.push(base_lm_cache_path.clone());
        }
        let lm_order = training.lm_order;
        let mix_weight = training.mix_weight as f64;
        run_task(
            &mut report,
            "language_model",
            &lm_deps,
            std::slice::from_ref(&language_model_path),
            || {
                let fst = WeightedFst::load(&intent_fst_path)?;
                let sentences: Vec<Vec<String>> = fst
                    .paths(Some(MAX_LM_SENTENCES))
                    .into_iter()
                    .map(|p| p.ilabels)
                    .collect();
                let mut model = lm::NgramModel::train(&sentences, lm_order);
                if mixing {
                    let base = lm::NgramModel::from_arpa(&std::fs::read_to_string(
                        &base_lm_cache_path,
                    )?)?;
                    model = lm::NgramModel::interpolate(&base, &model, mix_weight);
                }
                std::fs::write(&language_model_path, model.to_arpa())?;
                Ok(())
            },
        )?;

        // -- Phase: intent ---------------------------------------------------
        on_phase(TrainingPhase::Intent);

        let sample_cap = training.max_sentences_per_intent;
        match self.profile.config.intent.system {
            IntentBackend::Fst | IntentBackend::Command | IntentBackend::Dummy => {
                // The intent FST itself is the artifact; nothing further.
                debug!("no intent artifacts needed for {:?}", self.profile.config.intent.system);
            }
            IntentBackend::Fuzzy => {
                let examples_path = self
                    .profile
                    .write_path(&self.profile.config.intent.fuzzy.examples_json)?;
                run_task(
                    &mut report,
                    "intent_examples",
                    std::slice::from_ref(&intent_fst_path),
                    std::slice::from_ref(&examples_path),
                    || {
                        let fst = WeightedFst::load(&intent_fst_path)?;
                        let examples = intent_trainer::sentences_by_intent(&fst, sample_cap);
                        std::fs::write(
                            &examples_path,
                            intent_trainer::fuzzy_examples_json(&examples)?,
                        )?;
                        Ok(())
                    },
                )?;
            }
            IntentBackend::Keyword => {
                let keyword_path = self
                    .profile
                    .write_path(&self.profile.config.intent.keyword.config_json)?;
                let stop_words_path = self.profile.read_path("stop_words.txt");
                run_task(
                    &mut report,
                    "keyword_config",
                    std::slice::from_ref(&intent_fst_path),
                    std::slice::from_ref(&keyword_path),
                    || {
                        let fst = WeightedFst::load(&intent_fst_path)?;
                        let examples = intent_trainer::sentences_by_intent(&fst, sample_cap);
                        let stop_words: BTreeSet<String> = if stop_words_path.is_file() {
                            std::fs::read_to_string(&stop_words_path)?
                                .lines()
                                .map(str::trim)
                                .filter(|l| !l.is_empty())
                                .map(str::to_owned)
                                .collect()
                        } else {
                            BTreeSet::new()
                        };
                        let model = intent_trainer::keyword_model(&examples, &stop_words);
                        let json = serde_json::to_string_pretty(&model).map_err(|e| {
                            AssistantError::Training(format!("keyword serialize: {e}"))
                        })?;
                        std::fs::write(&keyword_path, json)?;
                        Ok(())
                    },
                )?;
            }
            IntentBackend::Remote => {
                let markdown_path = self.profile.write_path("intent_examples.md")?;
                let url = training.remote_trainer_url.clone();
                let language = language.clone();
                run_task(
                    &mut report,
                    "remote_trainer",
                    std::slice::from_ref(&intent_fst_path),
                    std::slice::from_ref(&markdown_path),
                    || {
                        if url.is_empty() {
                            return Err(AssistantError::Training(
                                "training.remote_trainer_url is not set".into(),
                            ));
                        }
                        let fst = WeightedFst::load(&intent_fst_path)?;
                        let examples = intent_trainer::sentences_by_intent(&fst, sample_cap);
                        let markdown = intent_trainer::examples_markdown(&examples);
                        std::fs::write(&markdown_path, &markdown)?;
                        intent_trainer::post_remote_training(&url, &language, &markdown)?;
                        Ok(())
                    },
                )?;
            }
        }

        info!(
            "training complete: {} task(s) ran, {} fresh",
            report.ran.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

/// Safety bound on exhaustive sentence enumeration for the language model.
const MAX_LM_SENTENCES: usize = 100_000;

fn run_task(
    report: &mut TrainingReport,
    name: &str,
    deps: &[PathBuf],
    targets: &[PathBuf],
    action: impl FnOnce() -> Result<()>,
) -> Result<()> {
    if !needs_run(deps, targets) {
        debug!("task '{name}' is fresh, skipping");
        report.skipped.push(name.to_owned());
        return Ok(());
    }
    info!("running task '{name}'");
    action().map_err(|e| AssistantError::Training(format!("{name}: {e}")))?;
    report.ran.push(name.to_owned());
    Ok(())
}

/// A task must run when any target is missing or any input is newer than
/// the oldest target.
fn needs_run(deps: &[PathBuf], targets: &[PathBuf]) -> bool {
    // A missing target always reruns; targets.min() is None in that case
    // because None orders before Some.
    let Some(oldest_target) = targets.iter().map(|t| mtime(t)).min().flatten() else {
        return true;
    };
    deps.iter()
        .any(|dep| mtime(dep).is_none_or(|m| m > oldest_target))
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

fn append_file(path: &Path, text: &str) -> Result<()> {
    use std::io::Write as _;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

fn join_lines(lines: impl Iterator<Item = String>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out
}
