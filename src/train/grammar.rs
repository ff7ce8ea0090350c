//! Sentence grammar compilation: `sentences.ini` → per-intent JSGF.
//!
//! The source format is `[IntentName]` sections containing bare sentences,
//! `rule = body;` definitions and `#` comments. Sentences become the
//! alternatives of one public rule named after the intent; `k = v` lines
//! become internal rules `<k> = (v);`. A sentence starting with a literal
//! `[` is escaped `\[` so it is not read as a section header.

use crate::error::{AssistantError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One parsed intent section.
#[derive(Debug, Clone, Default)]
pub struct IntentSection {
    /// Bare sentence lines, in file order.
    pub sentences: Vec<String>,
    /// `key = value` rule definitions, in file order.
    pub rules: Vec<(String, String)>,
}

/// Parse a sentence grammar file into sections, preserving file order.
///
/// # Errors
///
/// Returns a grammar error for content outside any section.
pub fn parse_sentences(text: &str) -> Result<Vec<(String, IntentSection)>> {
    let mut sections: Vec<(String, IntentSection)> = Vec::new();

    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') && !line.starts_with("\\[") {
            let name = line[1..line.len() - 1].trim().to_owned();
            if name.is_empty() {
                return Err(AssistantError::Grammar(format!(
                    "line {}: empty section name",
                    line_no + 1
                )));
            }
            sections.push((name, IntentSection::default()));
            continue;
        }

        let Some((_, section)) = sections.last_mut() else {
            return Err(AssistantError::Grammar(format!(
                "line {}: content before the first [Intent] section",
                line_no + 1
            )));
        };

        if let Some((lhs, rhs)) = line.split_once('=') {
            let key = lhs.trim();
            if is_rule_name(key) {
                section
                    .rules
                    .push((key.to_owned(), rhs.trim().trim_end_matches(';').to_owned()));
                continue;
            }
        }

        section.sentences.push(unescape_sentence(line));
    }

    Ok(sections)
}

/// The names of all intents in a sentence grammar file.
pub fn intent_names(text: &str) -> Vec<String> {
    parse_sentences(text)
        .map(|sections| sections.into_iter().map(|(name, _)| name).collect())
        .unwrap_or_default()
}

fn is_rule_name(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Drop the `\[` escape: the bracket is literal sentence content.
fn unescape_sentence(line: &str) -> String {
    line.replace("\\[", "[")
}

/// Write one JSGF grammar per intent into `grammars_dir`.
///
/// Stale `.gram` files are deleted first when `delete_old` is set, so
/// removed intents do not linger into the next artifact set. Returns the
/// generated paths, one per intent, in section order.
///
/// # Errors
///
/// Returns grammar or I/O errors.
pub fn write_grammars(
    sentences_text: &str,
    grammars_dir: &Path,
    language: &str,
    delete_old: bool,
) -> Result<Vec<PathBuf>> {
    let sections = parse_sentences(sentences_text)?;
    std::fs::create_dir_all(grammars_dir)?;

    if delete_old {
        let mut stale: Vec<PathBuf> = std::fs::read_dir(grammars_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("gram"))
            .collect();
        stale.sort();
        for path in stale {
            debug!("removing old grammar file: {}", path.display());
            std::fs::remove_file(&path)?;
        }
    }

    let mut paths = Vec::with_capacity(sections.len());
    for (intent, section) in &sections {
        let mut grammar = String::new();
        grammar.push_str(&format!("#JSGF V1.0 UTF-8 {language};\n"));
        grammar.push_str(&format!("grammar {intent};\n\n"));

        if !section.sentences.is_empty() {
            let alternatives: Vec<String> = section
                .sentences
                .iter()
                .map(|s| format!("({s})"))
                .collect();
            grammar.push_str(&format!(
                "public <{intent}> = ({});\n",
                alternatives.join(" | ")
            ));
        }
        for (key, value) in &section.rules {
            grammar.push_str(&format!("<{key}> = ({value});\n"));
        }

        let path = grammars_dir.join(format!("{intent}.gram"));
        std::fs::write(&path, grammar)?;
        paths.push(path);
    }

    info!("wrote {} grammar(s) to {}", paths.len(), grammars_dir.display());
    Ok(paths)
}
