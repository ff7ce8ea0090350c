//! Grammar-to-FST compilation.
//!
//! Each intent's rule tree compiles into a weighted FST; rule references
//! are realised by inlining the referenced rule's compiled form, and slot
//! references expand to the alternatives of the slot's value file. The
//! per-intent FSTs merge into a single union FST whose paths emit
//! `__label__<intent>` first and bracket tagged spans with
//! `__begin__`/`__end__` markers.
//!
//! Intents, slot files and rule maps are iterated in sorted order so the
//! compiled artifact is byte-stable across runs.

use crate::config::WordCasing;
use crate::error::{AssistantError, Result};
use crate::fst::{BEGIN_PREFIX, END_PREFIX, EPS, FstArc, LABEL_PREFIX, WeightedFst};
use crate::train::jsgf::{Expr, Grammar};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Load slot value files from a directory: one file per slot, one value per
/// line, blank lines ignored. File listing is sorted for determinism.
///
/// # Errors
///
/// Returns an I/O error when a slot file cannot be read.
pub fn load_slots(slots_dir: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let mut slots = BTreeMap::new();
    if !slots_dir.is_dir() {
        return Ok(slots);
    }

    let mut paths: Vec<_> = std::fs::read_dir(slots_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    for path in paths {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
        let values: Vec<String> = std::fs::read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        debug!("slot ${name}: {} value(s)", values.len());
        slots.insert(name, values);
    }

    Ok(slots)
}

/// The slot names referenced anywhere in an expression tree.
pub fn referenced_slots(expr: &Expr, into: &mut Vec<String>) {
    match expr {
        Expr::SlotRef(name) => {
            if !into.contains(name) {
                into.push(name.clone());
            }
        }
        Expr::Sequence(terms) | Expr::Alternatives(terms) => {
            for term in terms {
                referenced_slots(term, into);
            }
        }
        Expr::Optional(inner) => referenced_slots(inner, into),
        Expr::Tagged { expr, .. } => referenced_slots(expr, into),
        Expr::Literal(_) | Expr::RuleRef(_) => {}
    }
}

/// Compile all intent grammars into the merged intent FST.
///
/// # Errors
///
/// Returns grammar errors for unknown rule/slot references or rule cycles.
pub fn compile_intent_fst(
    grammars: &[Grammar],
    slots: &BTreeMap<String, Vec<String>>,
    casing: WordCasing,
) -> Result<WeightedFst> {
    let mut fst = WeightedFst::new();
    let final_state = fst.add_state();
    fst.set_final(final_state, 0.0);

    // Cross-grammar rule map: `Grammar.rule` everywhere, bare `rule` local.
    let mut global_rules: BTreeMap<String, &Expr> = BTreeMap::new();
    for grammar in grammars {
        for (rule_name, expr) in &grammar.rules {
            global_rules.insert(format!("{}.{}", grammar.name, rule_name), expr);
        }
    }

    let mut sorted: Vec<&Grammar> = grammars.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for grammar in sorted {
        let public = grammar.rules.get(&grammar.public_rule).ok_or_else(|| {
            AssistantError::Grammar(format!(
                "grammar '{}' is missing its public rule",
                grammar.name
            ))
        })?;

        let mut compiler = Compiler {
            fst: &mut fst,
            grammar,
            global_rules: &global_rules,
            slots,
            casing,
            visiting: Vec::new(),
        };
        let (enter, exit) = compiler.compile(public)?;

        // start --eps:__label__Intent--> intent fragment --> final.
        let label = fst
            .output_symbols
            .intern(&format!("{LABEL_PREFIX}{}", grammar.name));
        fst.add_arc(
            fst.start(),
            FstArc {
                ilabel: EPS,
                olabel: label,
                weight: 0.0,
                next_state: enter,
            },
        );
        fst.add_arc(
            exit,
            FstArc {
                ilabel: EPS,
                olabel: EPS,
                weight: 0.0,
                next_state: final_state,
            },
        );
    }

    info!(
        "compiled intent FST: {} state(s), {} word(s)",
        fst.num_states(),
        fst.input_vocabulary().len()
    );
    Ok(fst)
}

struct Compiler<'a> {
    fst: &'a mut WeightedFst,
    grammar: &'a Grammar,
    global_rules: &'a BTreeMap<String, &'a Expr>,
    slots: &'a BTreeMap<String, Vec<String>>,
    casing: WordCasing,
    /// Rules on the current inlining path, for cycle detection.
    visiting: Vec<String>,
}

impl Compiler<'_> {
    /// Compile an expression into a fragment, returning (enter, exit).
    fn compile(&mut self, expr: &Expr) -> Result<(u32, u32)> {
        match expr {
            Expr::Literal(word) => {
                let cased = self.casing.apply(word);
                self.word_fragment(&cased)
            }
            Expr::Sequence(terms) => {
                let enter = self.fst.add_state();
                let mut cursor = enter;
                for term in terms {
                    let (a, b) = self.compile(term)?;
                    self.eps_arc(cursor, a);
                    cursor = b;
                }
                Ok((enter, cursor))
            }
            Expr::Alternatives(alternatives) => {
                let enter = self.fst.add_state();
                let exit = self.fst.add_state();
                for alternative in alternatives {
                    let (a, b) = self.compile(alternative)?;
                    self.eps_arc(enter, a);
                    self.eps_arc(b, exit);
                }
                Ok((enter, exit))
            }
            Expr::Optional(inner) => {
                let enter = self.fst.add_state();
                let exit = self.fst.add_state();
                let (a, b) = self.compile(inner)?;
                self.eps_arc(enter, a);
                self.eps_arc(b, exit);
                self.eps_arc(enter, exit);
                Ok((enter, exit))
            }
            Expr::Tagged { expr, tag } => {
                let enter = self.fst.add_state();
                let exit = self.fst.add_state();
                let (a, b) = self.compile(expr)?;
                let begin = self
                    .fst
                    .output_symbols
                    .intern(&format!("{BEGIN_PREFIX}{tag}"));
                let end = self.fst.output_symbols.intern(&format!("{END_PREFIX}{tag}"));
                self.fst.add_arc(
                    enter,
                    FstArc {
                        ilabel: EPS,
                        olabel: begin,
                        weight: 0.0,
                        next_state: a,
                    },
                );
                self.fst.add_arc(
                    b,
                    FstArc {
                        ilabel: EPS,
                        olabel: end,
                        weight: 0.0,
                        next_state: exit,
                    },
                );
                Ok((enter, exit))
            }
            Expr::RuleRef(name) => {
                if self.visiting.iter().any(|r| r == name) {
                    return Err(AssistantError::Grammar(format!(
                        "rule cycle through <{name}>"
                    )));
                }
                let rule = self
                    .grammar
                    .rules
                    .get(name)
                    .or_else(|| self.global_rules.get(name).copied())
                    .ok_or_else(|| {
                        AssistantError::Grammar(format!(
                            "grammar '{}' references unknown rule <{name}>",
                            self.grammar.name
                        ))
                    })?;
                // Clone breaks the borrow on self.grammar/global map so the
                // rule body can be compiled recursively.
                let rule = rule.clone();
                self.visiting.push(name.clone());
                let fragment = self.compile(&rule);
                self.visiting.pop();
                fragment
            }
            Expr::SlotRef(name) => {
                let values = self.slots.get(name).ok_or_else(|| {
                    AssistantError::Grammar(format!(
                        "grammar '{}' references unknown slot ${name}",
                        self.grammar.name
                    ))
                })?;
                if values.is_empty() {
                    return Err(AssistantError::Grammar(format!("slot ${name} is empty")));
                }
                let enter = self.fst.add_state();
                let exit = self.fst.add_state();
                for value in values {
                    let mut cursor = enter;
                    let words: Vec<&str> = value.split_whitespace().collect();
                    for (i, word) in words.iter().enumerate() {
                        let cased = self.casing.apply(word);
                        let next = if i + 1 == words.len() {
                            exit
                        } else {
                            self.fst.add_state()
                        };
                        let ilabel = self.fst.input_symbols.intern(&cased);
                        let olabel = self.fst.output_symbols.intern(&cased);
                        self.fst.add_arc(
                            cursor,
                            FstArc {
                                ilabel,
                                olabel,
                                weight: 0.0,
                                next_state: next,
                            },
                        );
                        cursor = next;
                    }
                }
                Ok((enter, exit))
            }
        }
    }

    fn word_fragment(&mut self, word: &str) -> Result<(u32, u32)> {
        let enter = self.fst.add_state();
        let exit = self.fst.add_state();
        let ilabel = self.fst.input_symbols.intern(word);
        let olabel = self.fst.output_symbols.intern(word);
        self.fst.add_arc(
            enter,
            FstArc {
                ilabel,
                olabel,
                weight: 0.0,
                next_state: exit,
            },
        );
        Ok((enter, exit))
    }

    fn eps_arc(&mut self, from: u32, to: u32) {
        self.fst.add_arc(
            from,
            FstArc {
                ilabel: EPS,
                olabel: EPS,
                weight: 0.0,
                next_state: to,
            },
        );
    }
}
