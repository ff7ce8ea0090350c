//! ARPA n-gram language model construction.
//!
//! The intent FST's accepted sentences are counted into n-grams and
//! smoothed with Witten-Bell interpolation, expressed in backoff form so
//! the result is a standard ARPA file. When a base language model and a
//! mixing weight α are configured, the two models are merged n-gram by
//! n-gram (`p = α·p_base + (1−α)·p_intent`) and the backoff weights are
//! recomputed so every context still normalises.

use crate::error::{AssistantError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Sentence start marker.
pub const BOS: &str = "<s>";
/// Sentence end marker.
pub const EOS: &str = "</s>";

/// A backoff n-gram model with log10 probabilities.
#[derive(Debug, Clone)]
pub struct NgramModel {
    order: usize,
    /// Per order (index 0 = unigrams): n-gram → (log10 p, log10 bow).
    grams: Vec<BTreeMap<Vec<String>, (f64, Option<f64>)>>,
}

impl NgramModel {
    /// Model order.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Linear probability of an exact n-gram entry, if present.
    pub fn probability(&self, ngram: &[String]) -> Option<f64> {
        let table = self.grams.get(ngram.len().checked_sub(1)?)?;
        table.get(ngram).map(|(logp, _)| 10f64.powf(*logp))
    }

    /// Train a Witten-Bell-smoothed model from tokenised sentences.
    ///
    /// Sentences are wrapped in `<s>`/`</s>`. Lower-order estimates are
    /// interpolated into higher orders; the backoff weight of a context `h`
    /// is `T(h) / (c(h) + T(h))` with `T(h)` the number of distinct
    /// continuations, which makes every context normalise exactly.
    pub fn train(sentences: &[Vec<String>], order: usize) -> Self {
        let order = order.max(1);

        // Raw counts per order.
        let mut counts: Vec<BTreeMap<Vec<String>, u64>> = vec![BTreeMap::new(); order];
        for sentence in sentences {
            let mut tokens: Vec<String> = Vec::with_capacity(sentence.len() + 2);
            tokens.push(BOS.to_owned());
            tokens.extend(sentence.iter().cloned());
            tokens.push(EOS.to_owned());

            for n in 1..=order {
                for window in tokens.windows(n) {
                    *counts[n - 1].entry(window.to_vec()).or_insert(0) += 1;
                }
            }
        }

        // Distinct continuation types per context.
        let mut continuations: Vec<BTreeMap<Vec<String>, BTreeSet<String>>> =
            vec![BTreeMap::new(); order];
        for n in 2..=order {
            for ngram in counts[n - 1].keys() {
                let context = ngram[..n - 1].to_vec();
                let word = ngram[n - 1].clone();
                continuations[n - 2].entry(context).or_default().insert(word);
            }
        }

        let total_tokens: u64 = counts[0].values().sum();
        let vocab_size = counts[0].len().max(1) as f64;

        let mut grams: Vec<BTreeMap<Vec<String>, (f64, Option<f64>)>> =
            vec![BTreeMap::new(); order];

        // Unigrams: interpolated with the uniform distribution.
        let mut unigram_probs: BTreeMap<String, f64> = BTreeMap::new();
        for (ngram, &count) in &counts[0] {
            let p = (count as f64 + 1.0) / (total_tokens as f64 + vocab_size);
            unigram_probs.insert(ngram[0].clone(), p);
        }

        // Higher orders, built bottom-up so each order can interpolate the
        // one below.
        let mut lower: BTreeMap<Vec<String>, f64> = unigram_probs
            .iter()
            .map(|(w, p)| (vec![w.clone()], *p))
            .collect();

        for (word, p) in &unigram_probs {
            grams[0].insert(vec![word.clone()], (p.log10(), None));
        }

        for n in 2..=order {
            let mut current: BTreeMap<Vec<String>, f64> = BTreeMap::new();
            for (ngram, &count) in &counts[n - 1] {
                let context = &ngram[..n - 1];
                let context_count = *counts[n - 2].get(context).unwrap_or(&0);
                let types = continuations[n - 2]
                    .get(context)
                    .map(|s| s.len() as f64)
                    .unwrap_or(0.0);
                let lower_p = *lower.get(&ngram[1..].to_vec()).unwrap_or(&0.0);

                let p = (count as f64 + types * lower_p)
                    / (context_count as f64 + types).max(1.0);
                current.insert(ngram.clone(), p);
                grams[n - 1].insert(ngram.clone(), (p.log10(), None));
            }

            // Backoff weights live on the context entries one order down.
            for (context, types) in &continuations[n - 2] {
                let context_count = *counts[n - 2].get(context).unwrap_or(&0);
                let bow =
                    types.len() as f64 / (context_count as f64 + types.len() as f64);
                if let Some(entry) = grams[n - 2].get_mut(context) {
                    entry.1 = Some(bow.max(1e-10).log10());
                }
            }

            lower = current;
        }

        Self { order, grams }
    }

    /// Interpolate two models at weight `alpha` toward the base.
    ///
    /// Probabilities are merged linearly over the union of explicit
    /// n-grams; backoff weights are then recomputed per context so the
    /// merged model still normalises.
    pub fn interpolate(base: &Self, intent: &Self, alpha: f64) -> Self {
        let alpha = alpha.clamp(0.0, 1.0);
        let order = base.order.max(intent.order);
        let mut grams: Vec<BTreeMap<Vec<String>, (f64, Option<f64>)>> =
            vec![BTreeMap::new(); order];

        for n in 1..=order {
            let mut keys: BTreeSet<Vec<String>> = BTreeSet::new();
            if let Some(table) = base.grams.get(n - 1) {
                keys.extend(table.keys().cloned());
            }
            if let Some(table) = intent.grams.get(n - 1) {
                keys.extend(table.keys().cloned());
            }
            for ngram in keys {
                let pb = base.probability(&ngram).unwrap_or(0.0);
                let pi = intent.probability(&ngram).unwrap_or(0.0);
                let p = alpha * pb + (1.0 - alpha) * pi;
                if p > 0.0 {
                    grams[n - 1].insert(ngram, (p.log10(), None));
                }
            }
        }

        let mut merged = Self { order, grams };
        merged.recompute_backoffs();
        merged
    }

    /// Recompute backoff weights so each context's seen + backed-off mass
    /// sums to one.
    fn recompute_backoffs(&mut self) {
        for n in 2..=self.order {
            // Collect per-context sums at order n.
            let mut seen_mass: BTreeMap<Vec<String>, (f64, f64)> = BTreeMap::new();
            for (ngram, (logp, _)) in &self.grams[n - 1] {
                let context = ngram[..n - 1].to_vec();
                let suffix = ngram[1..].to_vec();
                let lower_p = self.probability(&suffix).unwrap_or(0.0);
                let entry = seen_mass.entry(context).or_insert((0.0, 0.0));
                entry.0 += 10f64.powf(*logp);
                entry.1 += lower_p;
            }
            for (context, (mass, lower_mass)) in seen_mass {
                let numerator = (1.0 - mass).max(1e-10);
                let denominator = (1.0 - lower_mass).max(1e-10);
                let bow = (numerator / denominator).max(1e-10);
                if let Some(entry) = self.grams[n - 2].get_mut(&context) {
                    entry.1 = Some(bow.log10());
                }
            }
        }
    }

    /// Serialize to ARPA text.
    pub fn to_arpa(&self) -> String {
        let mut out = String::new();
        out.push_str("\\data\\\n");
        for n in 1..=self.order {
            let _ = writeln!(out, "ngram {n}={}", self.grams[n - 1].len());
        }
        for n in 1..=self.order {
            let _ = write!(out, "\n\\{n}-grams:\n");
            for (ngram, (logp, bow)) in &self.grams[n - 1] {
                let words = ngram.join(" ");
                match bow {
                    Some(bow) => {
                        let _ = writeln!(out, "{logp:.6}\t{words}\t{bow:.6}");
                    }
                    None => {
                        let _ = writeln!(out, "{logp:.6}\t{words}");
                    }
                }
            }
        }
        out.push_str("\n\\end\\\n");
        out
    }

    /// Parse an ARPA file.
    ///
    /// # Errors
    ///
    /// Returns a training error on malformed sections or counts.
    pub fn from_arpa(text: &str) -> Result<Self> {
        let mut grams: Vec<BTreeMap<Vec<String>, (f64, Option<f64>)>> = Vec::new();
        let mut current_order: Option<usize> = None;
        let mut in_data = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "\\data\\" {
                in_data = true;
                continue;
            }
            if line == "\\end\\" {
                break;
            }
            if let Some(rest) = line.strip_prefix('\\')
                && let Some(order_str) = rest.strip_suffix("-grams:")
            {
                let order: usize = order_str.parse().map_err(|_| {
                    AssistantError::Training(format!("bad ARPA section: {line}"))
                })?;
                while grams.len() < order {
                    grams.push(BTreeMap::new());
                }
                current_order = Some(order);
                in_data = false;
                continue;
            }
            if in_data {
                // "ngram N=count" headers; counts are advisory.
                continue;
            }

            let Some(order) = current_order else { continue };
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < order + 1 {
                return Err(AssistantError::Training(format!("bad ARPA line: {line}")));
            }
            let logp: f64 = fields[0]
                .parse()
                .map_err(|_| AssistantError::Training(format!("bad ARPA line: {line}")))?;
            let ngram: Vec<String> =
                fields[1..=order].iter().map(|s| (*s).to_owned()).collect();
            let bow = if fields.len() > order + 1 {
                Some(fields[order + 1].parse().map_err(|_| {
                    AssistantError::Training(format!("bad ARPA line: {line}"))
                })?)
            } else {
                None
            };
            grams[order - 1].insert(ngram, (logp, bow));
        }

        if grams.is_empty() {
            return Err(AssistantError::Training("empty ARPA model".into()));
        }
        Ok(Self {
            order: grams.len(),
            grams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences() -> Vec<Vec<String>> {
        vec![
            vec!["turn".into(), "on".into(), "the".into(), "light".into()],
            vec!["turn".into(), "off".into(), "the".into(), "light".into()],
            vec!["what".into(), "time".into(), "is".into(), "it".into()],
        ]
    }

    #[test]
    fn unigrams_form_a_distribution() {
        let model = NgramModel::train(&sentences(), 3);
        let total: f64 = model.grams[0]
            .keys()
            .filter_map(|ngram| model.probability(ngram))
            .sum();
        assert!((total - 1.0).abs() < 1e-9, "unigram mass was {total}");
    }

    #[test]
    fn seen_plus_backoff_mass_normalises() {
        let model = NgramModel::train(&sentences(), 2);
        // For context "turn": p(on|turn) + p(off|turn) + bow(turn)·(unseen
        // unigram mass) must be 1.
        let context = vec!["turn".to_owned()];
        let (_, bow) = model.grams[0][&context];
        let bow = 10f64.powf(bow.expect("context should carry a backoff"));

        let mut seen = 0.0;
        let mut seen_lower = 0.0;
        for word in ["on", "off"] {
            seen += model
                .probability(&[context[0].clone(), word.to_owned()])
                .unwrap();
            seen_lower += model.probability(&[word.to_owned()]).unwrap();
        }
        let total = seen + bow * (1.0 - seen_lower);
        assert!((total - 1.0).abs() < 1e-9, "context mass was {total}");
    }

    #[test]
    fn arpa_round_trip() {
        let model = NgramModel::train(&sentences(), 3);
        let arpa = model.to_arpa();
        assert!(arpa.starts_with("\\data\\"));
        assert!(arpa.contains("\\1-grams:"));
        assert!(arpa.contains("\\3-grams:"));
        assert!(arpa.trim_end().ends_with("\\end\\"));

        let reparsed = NgramModel::from_arpa(&arpa).unwrap();
        assert_eq!(reparsed.order(), 3);
        // Probabilities survive the text round trip to printed precision.
        let ngram = vec!["turn".to_owned(), "on".to_owned()];
        let original = model.probability(&ngram).unwrap();
        let reloaded = reparsed.probability(&ngram).unwrap();
        assert!((original - reloaded).abs() < 1e-5);
    }

    #[test]
    fn interpolation_merges_probabilities() {
        let intent = NgramModel::train(&sentences(), 2);
        let base = NgramModel::train(
            &[vec!["play".to_owned(), "music".to_owned()]],
            2,
        );

        let merged = NgramModel::interpolate(&base, &intent, 0.5);
        let play = vec!["play".to_owned()];
        let expected = 0.5 * base.probability(&play).unwrap();
        let got = merged.probability(&play).unwrap();
        assert!((expected - got).abs() < 1e-9);

        let turn = vec!["turn".to_owned()];
        let expected = 0.5 * intent.probability(&turn).unwrap();
        let got = merged.probability(&turn).unwrap();
        assert!((expected - got).abs() < 1e-9);
    }

    #[test]
    fn alpha_zero_is_the_intent_model() {
        let intent = NgramModel::train(&sentences(), 2);
        let base = NgramModel::train(&[vec!["play".to_owned()]], 2);
        let merged = NgramModel::interpolate(&base, &intent, 0.0);

        let turn = vec!["turn".to_owned()];
        assert!(
            (merged.probability(&turn).unwrap() - intent.probability(&turn).unwrap()).abs()
                < 1e-12
        );
        // Base-only mass vanishes at α = 0.
        assert!(merged.probability(&["play".to_owned()]).is_none());
    }

    #[test]
    fn training_is_deterministic() {
        let a = NgramModel::train(&sentences(), 3).to_arpa();
        let b = NgramModel::train(&sentences(), 3).to_arpa();
        assert_eq!(a, b);
    }
}
