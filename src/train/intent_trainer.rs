//! Intent-recognizer artifact training.
//!
//! Derives whatever the configured recognition strategy needs from the
//! intent FST: nothing for the FST acceptor itself, example sentences for
//! the fuzzy matcher, a required/optional token configuration for the
//! keyword engine, or a Markdown example set POSTed to a remote trainer.
//! Sentence samples come from exhaustive enumeration or bounded random
//! sampling of FST paths.

use crate::error::{AssistantError, Result};
use crate::fst::{FstPath, WeightedFst, decode_output_symbols};
use crate::recognize::{KeywordIntent, KeywordModel, TrainedExample};
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Sample sentences per intent from the FST.
///
/// `cap = 0` enumerates exhaustively; otherwise up to `cap` sentences per
/// intent are drawn by random walk (seeded, so artifacts stay
/// reproducible).
pub fn sentences_by_intent(
    fst: &WeightedFst,
    cap: usize,
) -> BTreeMap<String, Vec<TrainedExample>> {
    let paths: Vec<FstPath> = if cap == 0 {
        fst.paths(None)
    } else {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        fst.sample_paths(cap.saturating_mul(8), &mut rng)
    };

    let mut by_intent: BTreeMap<String, Vec<TrainedExample>> = BTreeMap::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for path in paths {
        let decoded = decode_output_symbols(&path.olabels);
        if decoded.intent_name.is_empty() || decoded.text.is_empty() {
            continue;
        }
        let key = format!("{}\u{1f}{}", decoded.intent_name, decoded.text);
        if !seen.insert(key) {
            continue;
        }
        let examples = by_intent.entry(decoded.intent_name.clone()).or_default();
        if cap > 0 && examples.len() >= cap {
            continue;
        }
        examples.push(TrainedExample {
            tokens: decoded.text.split_whitespace().map(str::to_owned).collect(),
            text: decoded.text,
            entities: decoded.entities,
        });
    }

    let total: usize = by_intent.values().map(Vec::len).sum();
    debug!("{total} example sentence(s) across {} intent(s)", by_intent.len());
    by_intent
}

/// Serialize the fuzzy matcher's examples file.
///
/// # Errors
///
/// Returns a training error when serialization fails.
pub fn fuzzy_examples_json(examples: &BTreeMap<String, Vec<TrainedExample>>) -> Result<String> {
    serde_json::to_string_pretty(examples)
        .map_err(|e| AssistantError::Training(format!("examples serialize: {e}")))
}

/// Build the keyword engine's configuration from example sentences.
///
/// A token is **required** for an intent when it appears in every sampled
/// sentence and **optional** when it appears in some but not all; the same
/// rule applies to entities. Entity groups are prefixed `"<intent>."` so
/// the recognizer can map them back to slot names. `stop_words` are
/// excluded from keyword consideration entirely.
pub fn keyword_model(
    examples: &BTreeMap<String, Vec<TrainedExample>>,
    stop_words: &BTreeSet<String>,
) -> KeywordModel {
    let mut model = KeywordModel::default();

    for (intent_name, intent_examples) in examples {
        let num_sentences = intent_examples.len();
        if num_sentences == 0 {
            continue;
        }

        let mut word_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut entity_counts: BTreeMap<String, usize> = BTreeMap::new();

        for example in intent_examples {
            // Group slot values by entity; tokens inside entity values are
            // not keywords.
            let mut entity_tokens: BTreeSet<String> = BTreeSet::new();
            let mut entities_here: BTreeSet<String> = BTreeSet::new();
            for entity in &example.entities {
                let group = format!("{intent_name}.{}", entity.entity);
                model
                    .entities
                    .entry(group.clone())
                    .or_default()
                    .push(entity.value.clone());
                entities_here.insert(group);
                for token in entity.value.split_whitespace() {
                    entity_tokens.insert(token.to_owned());
                }
            }
            for group in entities_here {
                *entity_counts.entry(group).or_insert(0) += 1;
            }

            let words: BTreeSet<&String> = example
                .tokens
                .iter()
                .filter(|t| !entity_tokens.contains(*t) && !stop_words.contains(*t))
                .collect();
            for word in words {
                *word_counts.entry(word.clone()).or_insert(0) += 1;
            }
        }

        let mut intent = KeywordIntent::default();
        let mut required_words: Vec<String> = Vec::new();
        let mut optional_words: Vec<String> = Vec::new();
        for (word, count) in &word_counts {
            if *count == num_sentences {
                required_words.push(word.clone());
            } else {
                optional_words.push(word.clone());
            }
        }

        if !required_words.is_empty() {
            let group = format!("{intent_name}RequiredKeyword");
            model.entities.insert(group.clone(), required_words);
            intent.require.push(group);
        }
        if !optional_words.is_empty() {
            let group = format!("{intent_name}OptionalKeyword");
            model.entities.insert(group.clone(), optional_words);
            intent.optionally.push(group);
        }

        for (group, count) in &entity_counts {
            if *count == num_sentences {
                intent.require.push(group.clone());
            } else {
                intent.optionally.push(group.clone());
            }
        }

        model.intents.insert(intent_name.clone(), intent);
    }

    // Entity value lists accumulate once per sentence; dedup for the
    // artifact.
    for values in model.entities.values_mut() {
        values.sort();
        values.dedup();
    }

    model
}

/// Render the Markdown example set for a remote trainer.
///
/// One `## intent:<name>` section per intent; sentences carry their entity
/// spans in `[value](entity)` form.
pub fn examples_markdown(examples: &BTreeMap<String, Vec<TrainedExample>>) -> String {
    let mut out = String::new();
    for (intent_name, intent_examples) in examples {
        out.push_str(&format!("## intent:{intent_name}\n"));
        for example in intent_examples {
            out.push_str(&format!("- {}\n", tagged_sentence(example)));
        }
        out.push('\n');
    }
    out
}

fn tagged_sentence(example: &TrainedExample) -> String {
    // Entities are non-overlapping and ordered; splice the markdown tags
    // around their character spans.
    let mut pieces: Vec<String> = Vec::new();
    let mut cursor = 0usize;
    let text = &example.text;
    for entity in &example.entities {
        let (Some(start), Some(end)) = (entity.start, entity.end) else {
            continue;
        };
        if start > cursor {
            pieces.push(text[cursor..start].trim().to_owned());
        }
        pieces.push(format!("[{}]({})", &text[start..end], entity.entity));
        cursor = end;
    }
    if cursor < text.len() {
        pieces.push(text[cursor..].trim().to_owned());
    }
    pieces
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wrap the Markdown example set in the YAML envelope the remote trainer
/// expects and POST it.
///
/// # Errors
///
/// Returns a training error on network failure or a rejecting status.
pub fn post_remote_training(url: &str, language: &str, markdown: &str) -> Result<()> {
    let mut body = String::new();
    body.push_str(&format!("language: \"{language}\"\n\n"));
    body.push_str("data: |\n");
    for line in markdown.lines() {
        if line.is_empty() {
            body.push('\n');
        } else {
            body.push_str(&format!("  {line}\n"));
        }
    }

    // Training runs on a blocking thread; a local current-thread runtime
    // drives the single request.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AssistantError::Training(format!("runtime: {e}")))?;

    runtime.block_on(async move {
        let response = reqwest::Client::new()
            .post(url)
            .header("Content-Type", "application/x-yml")
            .body(body)
            .send()
            .await
            .map_err(|e| AssistantError::Training(format!("POST {url}: {e}")))?;
        response
            .error_for_status()
            .map_err(|e| AssistantError::Training(format!("remote trainer: {e}")))?;
        Ok::<(), AssistantError>(())
    })?;

    info!("posted training examples to {url}");
    Ok(())
}
