//! Weighted finite-state transducers for grammar-based intent recognition.
//!
//! Input symbols are lowercase word tokens; output symbols add the
//! meta-tokens `__label__<intent>`, `__begin__<entity>` and
//! `__end__<entity>`. A successful path through the intent FST yields both
//! the intent label and well-nested entity spans.
//!
//! Weights are tropical: path weight is the sum of arc weights and lower is
//! better. Serialization is a deterministic AT&T-style text format with
//! adjoining symbol-table files, so training artifacts are byte-stable and
//! diffable.

use crate::error::{AssistantError, Result};
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write as _;
use std::path::Path;

/// The reserved epsilon label.
pub const EPS: u32 = 0;
/// Epsilon's printed form.
pub const EPS_SYMBOL: &str = "<eps>";

/// Prefix marking an intent label output symbol.
pub const LABEL_PREFIX: &str = "__label__";
/// Prefix marking the start of a tagged span.
pub const BEGIN_PREFIX: &str = "__begin__";
/// Prefix marking the end of a tagged span.
pub const END_PREFIX: &str = "__end__";

/// Whether a symbol is one of the meta-tokens (or epsilon).
pub fn is_meta(symbol: &str) -> bool {
    symbol.starts_with("__") || symbol.starts_with('<')
}

/// Interned symbol table; id 0 is always `<eps>`.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<String>,
    index: HashMap<String, u32>,
}

impl SymbolTable {
    /// A table containing only epsilon.
    pub fn new() -> Self {
        let mut table = Self {
            symbols: Vec::new(),
            index: HashMap::new(),
        };
        table.intern(EPS_SYMBOL);
        table
    }

    /// Intern a symbol, returning its id.
    pub fn intern(&mut self, symbol: &str) -> u32 {
        if let Some(&id) = self.index.get(symbol) {
            return id;
        }
        let id = self.symbols.len() as u32;
        self.symbols.push(symbol.to_owned());
        self.index.insert(symbol.to_owned(), id);
        id
    }

    /// Look up an id without interning.
    pub fn id(&self, symbol: &str) -> Option<u32> {
        self.index.get(symbol).copied()
    }

    /// The symbol for an id.
    pub fn symbol(&self, id: u32) -> Option<&str> {
        self.symbols.get(id as usize).map(String::as_str)
    }

    /// All symbols except epsilon.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().skip(1).map(String::as_str)
    }

    /// Number of symbols including epsilon.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// True when only epsilon is present.
    pub fn is_empty(&self) -> bool {
        self.symbols.len() <= 1
    }
}

/// One transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FstArc {
    /// Input label id (0 = epsilon: consumes no token).
    pub ilabel: u32,
    /// Output label id (0 = epsilon: emits nothing).
    pub olabel: u32,
    /// Arc weight (tropical; lower is better).
    pub weight: f32,
    /// Destination state.
    pub next_state: u32,
}

/// A weighted transducer.
#[derive(Debug, Clone)]
pub struct WeightedFst {
    /// Input symbol table.
    pub input_symbols: SymbolTable,
    /// Output symbol table.
    pub output_symbols: SymbolTable,
    states: Vec<Vec<FstArc>>,
    start: u32,
    finals: HashMap<u32, f32>,
}

/// A complete path through an FST.
#[derive(Debug, Clone)]
pub struct FstPath {
    /// Input symbols along the path (epsilon omitted).
    pub ilabels: Vec<String>,
    /// Output symbols along the path (epsilon omitted).
    pub olabels: Vec<String>,
    /// Total path weight.
    pub weight: f32,
}

impl Default for WeightedFst {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedFst {
    /// An empty FST with a start state and fresh symbol tables.
    pub fn new() -> Self {
        Self {
            input_symbols: SymbolTable::new(),
            output_symbols: SymbolTable::new(),
            states: vec![Vec::new()],
            start: 0,
            finals: HashMap::new(),
        }
    }

    /// Add a state, returning its id.
    pub fn add_state(&mut self) -> u32 {
        self.states.push(Vec::new());
        (self.states.len() - 1) as u32
    }

    /// The start state.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number of states.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Add an arc from `state`.
    pub fn add_arc(&mut self, state: u32, arc: FstArc) {
        self.states[state as usize].push(arc);
    }

    /// Mark a state final with the given weight.
    pub fn set_final(&mut self, state: u32, weight: f32) {
        self.finals.insert(state, weight);
    }

    /// Final weight of a state, if final.
    pub fn final_weight(&self, state: u32) -> Option<f32> {
        self.finals.get(&state).copied()
    }

    /// Arcs leaving a state.
    pub fn arcs(&self, state: u32) -> &[FstArc] {
        &self.states[state as usize]
    }

    /// Non-meta input vocabulary, sorted.
    pub fn input_vocabulary(&self) -> Vec<String> {
        let mut words: Vec<String> = self
            .input_symbols
            .symbols()
            .filter(|s| !is_meta(s))
            .map(str::to_owned)
            .collect();
        words.sort();
        words
    }

    // -- Acceptance ----------------------------------------------------------

    /// Accept a token sequence, returning the best (lowest-weight) path.
    ///
    /// Epsilon input arcs are followed without consuming tokens. Returns
    /// `None` when no accepting path exists or a token is outside the input
    /// alphabet.
    pub fn accept(&self, tokens: &[&str]) -> Option<FstPath> {
        let mut ids = Vec::with_capacity(tokens.len());
        for token in tokens {
            ids.push(self.input_symbols.id(token)?);
        }

        // Dijkstra over (state, tokens consumed).
        #[derive(PartialEq)]
        struct Entry {
            weight: f32,
            node: (u32, usize),
        }
        impl Eq for Entry {}
        impl Ord for Entry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                // Reverse for a min-heap; weights are finite by construction.
                other
                    .weight
                    .partial_cmp(&self.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }
        }
        impl PartialOrd for Entry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut best: HashMap<(u32, usize), f32> = HashMap::new();
        let mut parent: HashMap<(u32, usize), ((u32, usize), FstArc)> = HashMap::new();
        let mut heap = BinaryHeap::new();

        let start = (self.start, 0usize);
        best.insert(start, 0.0);
        heap.push(Entry {
            weight: 0.0,
            node: start,
        });

        let mut goal: Option<((u32, usize), f32)> = None;

        while let Some(Entry { weight, node }) = heap.pop() {
            if best.get(&node).is_some_and(|&w| weight > w) {
                continue;
            }
            let (state, consumed) = node;

            if consumed == ids.len()
                && let Some(final_weight) = self.final_weight(state)
            {
                let total = weight + final_weight;
                if goal.is_none_or(|(_, w)| total < w) {
                    goal = Some((node, total));
                }
            }

            for &arc in self.arcs(state) {
                let next = if arc.ilabel == EPS {
                    Some((arc.next_state, consumed))
                } else if consumed < ids.len() && ids[consumed] == arc.ilabel {
                    Some((arc.next_state, consumed + 1))
                } else {
                    None
                };
                let Some(next) = next else { continue };
                let next_weight = weight + arc.weight;
                if best.get(&next).is_none_or(|&w| next_weight < w) {
                    best.insert(next, next_weight);
                    parent.insert(next, (node, arc));
                    heap.push(Entry {
                        weight: next_weight,
                        node: next,
                    });
                }
            }
        }

        let (goal_node, total_weight) = goal?;

        // Rebuild the path backwards.
        let mut arcs_rev = Vec::new();
        let mut cursor = goal_node;
        while cursor != start {
            let (prev, arc) = parent.get(&cursor).copied()?;
            arcs_rev.push(arc);
            cursor = prev;
        }
        arcs_rev.reverse();

        let mut path = FstPath {
            ilabels: Vec::new(),
            olabels: Vec::new(),
            weight: total_weight,
        };
        for arc in arcs_rev {
            if arc.ilabel != EPS
                && let Some(sym) = self.input_symbols.symbol(arc.ilabel)
            {
                path.ilabels.push(sym.to_owned());
            }
            if arc.olabel != EPS
                && let Some(sym) = self.output_symbols.symbol(arc.olabel)
            {
                path.olabels.push(sym.to_owned());
            }
        }
        Some(path)
    }

    // -- Enumeration ---------------------------------------------------------

    /// Enumerate accepting paths depth-first, up to `limit` (None = all).
    ///
    /// Cycles are cut by never revisiting a state on the current path, so
    /// enumeration terminates even on cyclic grammars.
    pub fn paths(&self, limit: Option<usize>) -> Vec<FstPath> {
        let mut results = Vec::new();
        let mut on_path = vec![false; self.states.len()];
        let mut arc_stack: Vec<FstArc> = Vec::new();
        self.paths_from(
            self.start,
            0.0,
            &mut on_path,
            &mut arc_stack,
            &mut results,
            limit,
        );
        results
    }

    fn paths_from(
        &self,
        state: u32,
        weight: f32,
        on_path: &mut Vec<bool>,
        arc_stack: &mut Vec<FstArc>,
        results: &mut Vec<FstPath>,
        limit: Option<usize>,
    ) {
        if limit.is_some_and(|l| results.len() >= l) {
            return;
        }
        if let Some(final_weight) = self.final_weight(state) {
            let mut path = FstPath {
                ilabels: Vec::new(),
                olabels: Vec::new(),
                weight: weight + final_weight,
            };
            for arc in arc_stack.iter() {
                if arc.ilabel != EPS
                    && let Some(sym) = self.input_symbols.symbol(arc.ilabel)
                {
                    path.ilabels.push(sym.to_owned());
                }
                if arc.olabel != EPS
                    && let Some(sym) = self.output_symbols.symbol(arc.olabel)
                {
                    path.olabels.push(sym.to_owned());
                }
            }
            results.push(path);
        }

        on_path[state as usize] = true;
        for &arc in self.arcs(state) {
            if on_path[arc.next_state as usize] {
                continue;
            }
            arc_stack.push(arc);
            self.paths_from(
                arc.next_state,
                weight + arc.weight,
                on_path,
                arc_stack,
                results,
                limit,
            );
            arc_stack.pop();
        }
        on_path[state as usize] = false;
    }

    /// Sample `count` accepting paths by uniform random walk.
    ///
    /// Walks restart on dead ends; a depth guard bounds each walk.
    pub fn sample_paths<R: rand::Rng>(&self, count: usize, rng: &mut R) -> Vec<FstPath> {
        use rand::seq::SliceRandom;

        let max_depth = self.states.len() * 4 + 64;
        let mut results = Vec::with_capacity(count);

        'walks: for _ in 0..count * 4 {
            if results.len() >= count {
                break;
            }
            let mut state = self.start;
            let mut arcs_taken: Vec<FstArc> = Vec::new();
            for _ in 0..max_depth {
                let is_final = self.final_weight(state).is_some();
                let arcs = self.arcs(state);
                // At a final state, stop with probability proportional to
                // the absence of alternatives.
                if is_final && (arcs.is_empty() || rng.gen_bool(0.5)) {
                    let weight: f32 = arcs_taken.iter().map(|a| a.weight).sum::<f32>()
                        + self.final_weight(state).unwrap_or(0.0);
                    let mut path = FstPath {
                        ilabels: Vec::new(),
                        olabels: Vec::new(),
                        weight,
                    };
                    for arc in &arcs_taken {
                        if arc.ilabel != EPS
                            && let Some(sym) = self.input_symbols.symbol(arc.ilabel)
                        {
                            path.ilabels.push(sym.to_owned());
                        }
                        if arc.olabel != EPS
                            && let Some(sym) = self.output_symbols.symbol(arc.olabel)
                        {
                            path.olabels.push(sym.to_owned());
                        }
                    }
                    results.push(path);
                    continue 'walks;
                }
                let Some(&arc) = arcs.choose(rng) else {
                    continue 'walks;
                };
                arcs_taken.push(arc);
                state = arc.next_state;
            }
        }

        results
    }

    // -- Serialization -------------------------------------------------------

    /// Serialize to the deterministic text format.
    ///
    /// Arc lines are `src<TAB>dst<TAB>ilabel<TAB>olabel<TAB>weight`; final
    /// lines are `state<TAB>weight`. Symbols are printed by name.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (state, arcs) in self.states.iter().enumerate() {
            for arc in arcs {
                let isym = self.input_symbols.symbol(arc.ilabel).unwrap_or(EPS_SYMBOL);
                let osym = self.output_symbols.symbol(arc.olabel).unwrap_or(EPS_SYMBOL);
                let _ = writeln!(
                    out,
                    "{state}\t{}\t{isym}\t{osym}\t{}",
                    arc.next_state, arc.weight
                );
            }
        }
        let mut finals: Vec<_> = self.finals.iter().collect();
        finals.sort_by_key(|(state, _)| **state);
        for (state, weight) in finals {
            let _ = writeln!(out, "{state}\t{weight}");
        }
        out
    }

    /// Write the FST and its symbol tables next to `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the files cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_text())?;
        std::fs::write(
            path.with_extension("fst.isyms"),
            symbol_table_text(&self.input_symbols),
        )?;
        std::fs::write(
            path.with_extension("fst.osyms"),
            symbol_table_text(&self.output_symbols),
        )?;
        Ok(())
    }

    /// Parse the text format produced by [`WeightedFst::to_text`].
    ///
    /// # Errors
    ///
    /// Returns a grammar error on malformed lines.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut fst = Self::new();

        let mut ensure_state = |fst: &mut Self, id: u32| {
            while fst.states.len() <= id as usize {
                fst.add_state();
            }
        };

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            match fields.as_slice() {
                [src, dst, isym, osym, weight] => {
                    let src: u32 = parse_field(src, line_no)?;
                    let dst: u32 = parse_field(dst, line_no)?;
                    let weight: f32 = parse_field(weight, line_no)?;
                    ensure_state(&mut fst, src.max(dst));
                    let ilabel = fst.input_symbols.intern(isym);
                    let olabel = fst.output_symbols.intern(osym);
                    fst.add_arc(
                        src,
                        FstArc {
                            ilabel,
                            olabel,
                            weight,
                            next_state: dst,
                        },
                    );
                }
                [state, weight] => {
                    let state: u32 = parse_field(state, line_no)?;
                    let weight: f32 = parse_field(weight, line_no)?;
                    ensure_state(&mut fst, state);
                    fst.set_final(state, weight);
                }
                _ => {
                    return Err(AssistantError::Grammar(format!(
                        "FST line {}: expected 2 or 5 fields, got {}",
                        line_no + 1,
                        fields.len()
                    )));
                }
            }
        }

        Ok(fst)
    }

    /// Load an FST previously written with [`WeightedFst::save`].
    ///
    /// # Errors
    ///
    /// Returns an error when the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AssistantError::Grammar(format!("cannot read FST {}: {e}", path.display()))
        })?;
        Self::from_text(&text)
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, line_no: usize) -> Result<T> {
    field.parse().map_err(|_| {
        AssistantError::Grammar(format!("FST line {}: bad field '{field}'", line_no + 1))
    })
}

fn symbol_table_text(table: &SymbolTable) -> String {
    let mut out = String::new();
    for (id, symbol) in std::iter::once(EPS_SYMBOL)
        .chain(table.symbols())
        .enumerate()
    {
        let _ = writeln!(out, "{symbol}\t{id}");
    }
    out
}

// ---------------------------------------------------------------------------
// Output symbol interpretation
// ---------------------------------------------------------------------------

/// A path's output symbols decoded into intent name, text and entity spans.
#[derive(Debug, Clone, Default)]
pub struct DecodedSentence {
    /// Intent name from the `__label__` marker.
    pub intent_name: String,
    /// Reconstructed sentence text.
    pub text: String,
    /// Entity spans with character offsets into `text`.
    pub entities: Vec<crate::pipeline::messages::Entity>,
}

/// Decode an output symbol sequence into intent, text and entities.
///
/// `__begin__e`/`__end__e` markers must be well-nested (they are by
/// construction); words between them form the entity value, normalised to
/// `value` or the `:normalized` half when the tag carried one.
pub fn decode_output_symbols(olabels: &[String]) -> DecodedSentence {
    let mut decoded = DecodedSentence::default();
    let mut text = String::new();
    let mut open: Option<(String, usize, String)> = None; // (entity, start, words)

    for symbol in olabels {
        if let Some(intent) = symbol.strip_prefix(LABEL_PREFIX) {
            decoded.intent_name = intent.to_owned();
        } else if let Some(entity) = symbol.strip_prefix(BEGIN_PREFIX) {
            open = Some((strip_normalized(entity), next_offset(&text), String::new()));
        } else if let Some(entity) = symbol.strip_prefix(END_PREFIX) {
            if let Some((open_entity, start, words)) = open.take() {
                debug_assert_eq!(open_entity, strip_normalized(entity));
                let (entity_name, normalized) = split_normalized(entity);
                let value = normalized.unwrap_or_else(|| words.clone());
                decoded.entities.push(crate::pipeline::messages::Entity {
                    entity: entity_name,
                    value,
                    start: Some(start),
                    end: Some(text.len()),
                    confidence: None,
                });
            }
        } else if !is_meta(symbol) {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(symbol);
            if let Some((_, _, words)) = open.as_mut() {
                if !words.is_empty() {
                    words.push(' ');
                }
                words.push_str(symbol);
            }
        }
    }

    decoded.text = text;
    decoded
}

fn next_offset(text: &str) -> usize {
    if text.is_empty() { 0 } else { text.len() + 1 }
}

fn strip_normalized(entity: &str) -> String {
    entity.split(':').next().unwrap_or(entity).to_owned()
}

fn split_normalized(entity: &str) -> (String, Option<String>) {
    match entity.split_once(':') {
        Some((name, normalized)) => (name.to_owned(), Some(normalized.to_owned())),
        None => (entity.to_owned(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// turn (on|off){state} the light → intent TestIntent
    fn light_fst() -> WeightedFst {
        let mut fst = WeightedFst::new();
        let s1 = fst.add_state();
        let s2 = fst.add_state();
        let s3 = fst.add_state();
        let s4 = fst.add_state();
        let s5 = fst.add_state();
        let s6 = fst.add_state();

        let label = fst.output_symbols.intern("__label__TestIntent");
        fst.add_arc(
            0,
            FstArc {
                ilabel: EPS,
                olabel: label,
                weight: 0.0,
                next_state: s1,
            },
        );

        let turn_i = fst.input_symbols.intern("turn");
        let turn_o = fst.output_symbols.intern("turn");
        fst.add_arc(
            s1,
            FstArc {
                ilabel: turn_i,
                olabel: turn_o,
                weight: 0.0,
                next_state: s2,
            },
        );

        let begin = fst.output_symbols.intern("__begin__state");
        fst.add_arc(
            s2,
            FstArc {
                ilabel: EPS,
                olabel: begin,
                weight: 0.0,
                next_state: s3,
            },
        );

        for word in ["on", "off"] {
            let wi = fst.input_symbols.intern(word);
            let wo = fst.output_symbols.intern(word);
            fst.add_arc(
                s3,
                FstArc {
                    ilabel: wi,
                    olabel: wo,
                    weight: 0.0,
                    next_state: s4,
                },
            );
        }

        let end = fst.output_symbols.intern("__end__state");
        fst.add_arc(
            s4,
            FstArc {
                ilabel: EPS,
                olabel: end,
                weight: 0.0,
                next_state: s5,
            },
        );

        let the_i = fst.input_symbols.intern("the");
        let the_o = fst.output_symbols.intern("the");
        fst.add_arc(
            s5,
            FstArc {
                ilabel: the_i,
                olabel: the_o,
                weight: 0.0,
                next_state: s6,
            },
        );
        let light_i = fst.input_symbols.intern("light");
        let light_o = fst.output_symbols.intern("light");
        let s7 = fst.add_state();
        fst.add_arc(
            s6,
            FstArc {
                ilabel: light_i,
                olabel: light_o,
                weight: 0.0,
                next_state: s7,
            },
        );
        fst.set_final(s7, 0.0);
        fst
    }

    #[test]
    fn accepts_valid_sentence() {
        let fst = light_fst();
        let path = fst.accept(&["turn", "on", "the", "light"]).unwrap();
        assert_eq!(path.ilabels, vec!["turn", "on", "the", "light"]);
        assert!(path.olabels.contains(&"__label__TestIntent".to_owned()));
    }

    #[test]
    fn rejects_invalid_sentence() {
        let fst = light_fst();
        assert!(fst.accept(&["turn", "on", "light"]).is_none());
        assert!(fst.accept(&["open", "the", "door"]).is_none());
    }

    #[test]
    fn decoding_recovers_intent_and_spans() {
        let fst = light_fst();
        let path = fst.accept(&["turn", "off", "the", "light"]).unwrap();
        let decoded = decode_output_symbols(&path.olabels);
        assert_eq!(decoded.intent_name, "TestIntent");
        assert_eq!(decoded.text, "turn off the light");
        assert_eq!(decoded.entities.len(), 1);
        let entity = &decoded.entities[0];
        assert_eq!(entity.entity, "state");
        assert_eq!(entity.value, "off");
        assert_eq!(&decoded.text[entity.start.unwrap()..entity.end.unwrap()], "off");
    }

    #[test]
    fn enumeration_covers_all_alternatives() {
        let fst = light_fst();
        let paths = fst.paths(None);
        assert_eq!(paths.len(), 2);
        let mut sentences: Vec<String> = paths.iter().map(|p| p.ilabels.join(" ")).collect();
        sentences.sort();
        assert_eq!(
            sentences,
            vec!["turn off the light", "turn on the light"]
        );
    }

    #[test]
    fn text_round_trip_preserves_acceptance() {
        let fst = light_fst();
        let text = fst.to_text();
        let reloaded = WeightedFst::from_text(&text).unwrap();
        assert!(reloaded.accept(&["turn", "on", "the", "light"]).is_some());
        assert!(reloaded.accept(&["on", "turn"]).is_none());
        // Determinism: serializing again is byte-identical.
        assert_eq!(text, reloaded.to_text());
    }

    #[test]
    fn vocabulary_excludes_meta_symbols() {
        let fst = light_fst();
        let vocab = fst.input_vocabulary();
        assert_eq!(vocab, vec!["light", "off", "on", "the", "turn"]);
    }

    #[test]
    fn sampling_yields_accepting_paths() {
        use rand::SeedableRng;
        let fst = light_fst();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let samples = fst.sample_paths(5, &mut rng);
        assert!(!samples.is_empty());
        for path in samples {
            let tokens: Vec<&str> = path.ilabels.iter().map(String::as_str).collect();
            assert!(fst.accept(&tokens).is_some());
        }
    }
}
