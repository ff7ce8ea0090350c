//! JSGF grammar parsing.
//!
//! Parses the per-intent grammars produced by the sentence compiler into an
//! abstract rule tree. The dialect covers what the sentence grammar can
//! express: sequences, alternatives `(a | b)`, optional groups `[x]`,
//! required groups `(x)`, literals, rule references `<Rule>`, slot
//! references `$slot`, JSGF tags `{entity}` / `{entity:normalized}` and
//! markdown-style taggings `[value](entity)`.

use crate::error::{AssistantError, Result};
use std::collections::BTreeMap;

/// One node of the rule tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A single word.
    Literal(String),
    /// Terms in order.
    Sequence(Vec<Expr>),
    /// `(a | b | c)`.
    Alternatives(Vec<Expr>),
    /// `[x]`: may be skipped.
    Optional(Box<Expr>),
    /// `<Rule>`: substituted at compile time.
    RuleRef(String),
    /// `$slot`: substituted from the slot's value file.
    SlotRef(String),
    /// An expression bracketed by `__begin__`/`__end__` markers.
    Tagged {
        /// The tagged expression.
        expr: Box<Expr>,
        /// `entity` or `entity:normalized`.
        tag: String,
    },
}

/// A parsed grammar: name plus rules, exactly one of them public.
#[derive(Debug, Clone)]
pub struct Grammar {
    /// Grammar name (the intent name).
    pub name: String,
    /// Name of the public rule.
    pub public_rule: String,
    /// Rule name → body.
    pub rules: BTreeMap<String, Expr>,
}

/// Parse a JSGF grammar file's text.
///
/// # Errors
///
/// Returns a grammar error on syntax problems or when no public rule is
/// declared.
pub fn parse_grammar(text: &str) -> Result<Grammar> {
    let mut name = String::new();
    let mut public_rule = String::new();
    let mut rules = BTreeMap::new();

    // Join rule bodies split over multiple lines: statements end with ';'.
    let mut statement = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("#JSGF") || line.starts_with("//") {
            continue;
        }
        statement.push_str(line);
        statement.push(' ');
        if !line.ends_with(';') {
            continue;
        }

        let complete = statement.trim().trim_end_matches(';').trim().to_owned();
        statement.clear();

        if let Some(grammar_name) = complete.strip_prefix("grammar ") {
            name = grammar_name.trim().to_owned();
            continue;
        }

        let (is_public, rest) = match complete.strip_prefix("public ") {
            Some(rest) => (true, rest.trim()),
            None => (false, complete.as_str()),
        };

        let (rule_name, body) = parse_rule_header(rest)?;
        let expr = parse_expr(body)?;
        if is_public {
            public_rule = rule_name.clone();
        }
        rules.insert(rule_name, expr);
    }

    if name.is_empty() {
        return Err(AssistantError::Grammar("missing 'grammar <name>;'".into()));
    }
    if public_rule.is_empty() {
        return Err(AssistantError::Grammar(format!(
            "grammar '{name}' has no public rule"
        )));
    }

    Ok(Grammar {
        name,
        public_rule,
        rules,
    })
}

fn parse_rule_header(statement: &str) -> Result<(String, &str)> {
    let statement = statement.trim();
    if !statement.starts_with('<') {
        return Err(AssistantError::Grammar(format!(
            "expected '<rule> = body': {statement}"
        )));
    }
    let close = statement
        .find('>')
        .ok_or_else(|| AssistantError::Grammar(format!("unterminated rule name: {statement}")))?;
    let rule_name = statement[1..close].trim().to_owned();
    let rest = statement[close + 1..].trim();
    let body = rest
        .strip_prefix('=')
        .ok_or_else(|| AssistantError::Grammar(format!("expected '=' after rule name: {statement}")))?;
    Ok((rule_name, body.trim()))
}

/// Parse a rule body into an expression tree.
///
/// # Errors
///
/// Returns a grammar error on unbalanced brackets or stray tokens.
pub fn parse_expr(body: &str) -> Result<Expr> {
    let mut parser = Parser {
        chars: body.chars().collect(),
        pos: 0,
    };
    let expr = parser.parse_alternatives()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(AssistantError::Grammar(format!(
            "unexpected '{}' at offset {} in: {body}",
            parser.peek().unwrap_or(' '),
            parser.pos
        )));
    }
    Ok(expr)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// alternatives := sequence ('|' sequence)*
    fn parse_alternatives(&mut self) -> Result<Expr> {
        let mut alternatives = vec![self.parse_sequence()?];
        loop {
            self.skip_ws();
            if self.peek() == Some('|') {
                self.bump();
                alternatives.push(self.parse_sequence()?);
            } else {
                break;
            }
        }
        Ok(if alternatives.len() == 1 {
            alternatives.pop().unwrap_or(Expr::Sequence(Vec::new()))
        } else {
            Expr::Alternatives(alternatives)
        })
    }

    /// sequence := term*
    fn parse_sequence(&mut self) -> Result<Expr> {
        let mut terms = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None | Some('|') | Some(')') | Some(']') => break,
                _ => terms.push(self.parse_term()?),
            }
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap_or(Expr::Sequence(Vec::new()))
        } else {
            Expr::Sequence(terms)
        })
    }

    /// term := (group | optional | ruleref | slotref | word) tag?
    fn parse_term(&mut self) -> Result<Expr> {
        self.skip_ws();
        let expr = match self.peek() {
            Some('(') => {
                self.bump();
                let inner = self.parse_alternatives()?;
                self.expect(')')?;
                inner
            }
            Some('[') => {
                self.bump();
                let inner = self.parse_alternatives()?;
                self.expect(']')?;
                // Markdown tagging: `[value](entity)` is a required, tagged
                // expression, not an optional group.
                if self.peek() == Some('(') {
                    self.bump();
                    let tag = self.read_until(')')?;
                    return Ok(Expr::Tagged {
                        expr: Box::new(inner),
                        tag,
                    });
                }
                Expr::Optional(Box::new(inner))
            }
            Some('<') => {
                self.bump();
                let rule_name = self.read_until('>')?;
                Expr::RuleRef(rule_name)
            }
            Some('$') => {
                self.bump();
                Expr::SlotRef(self.read_word())
            }
            Some(_) => {
                let word = self.read_word();
                if word.is_empty() {
                    return Err(AssistantError::Grammar(format!(
                        "unexpected character at offset {}",
                        self.pos
                    )));
                }
                Expr::Literal(word)
            }
            None => return Err(AssistantError::Grammar("unexpected end of rule".into())),
        };

        // JSGF tag: `expr {entity}` or `expr {entity:normalized}`.
        self.skip_ws();
        if self.peek() == Some('{') {
            self.bump();
            let tag = self.read_until('}')?;
            return Ok(Expr::Tagged {
                expr: Box::new(expr),
                tag,
            });
        }
        Ok(expr)
    }

    fn expect(&mut self, close: char) -> Result<()> {
        self.skip_ws();
        if self.bump() == Some(close) {
            Ok(())
        } else {
            Err(AssistantError::Grammar(format!("expected '{close}'")))
        }
    }

    fn read_until(&mut self, close: char) -> Result<String> {
        let mut out = String::new();
        while let Some(c) = self.bump() {
            if c == close {
                return Ok(out.trim().to_owned());
            }
            out.push(c);
        }
        Err(AssistantError::Grammar(format!("expected '{close}'")))
    }

    fn read_word(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || "()[]<>{}|$".contains(c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_words_and_alternatives() {
        let expr = parse_expr("turn (on | off) the light").unwrap();
        let Expr::Sequence(terms) = expr else {
            panic!("expected sequence");
        };
        assert_eq!(terms.len(), 4);
        assert_eq!(terms[0], Expr::Literal("turn".into()));
        assert!(matches!(&terms[1], Expr::Alternatives(alts) if alts.len() == 2));
    }

    #[test]
    fn parses_optionals_and_tags() {
        let expr = parse_expr("turn [the] (kitchen | bedroom){name} light").unwrap();
        let Expr::Sequence(terms) = expr else {
            panic!("expected sequence");
        };
        assert!(matches!(&terms[1], Expr::Optional(_)));
        let Expr::Tagged { tag, .. } = &terms[2] else {
            panic!("expected tagged group");
        };
        assert_eq!(tag, "name");
    }

    #[test]
    fn parses_markdown_tagging() {
        let expr = parse_expr("set it to [blue](color:0000ff)").unwrap();
        let Expr::Sequence(terms) = expr else {
            panic!("expected sequence");
        };
        let Expr::Tagged { expr, tag } = &terms[3] else {
            panic!("expected tagged value");
        };
        assert_eq!(tag, "color:0000ff");
        assert_eq!(**expr, Expr::Literal("blue".into()));
    }

    #[test]
    fn parses_rule_and_slot_refs() {
        let expr = parse_expr("<Greeting> $name").unwrap();
        let Expr::Sequence(terms) = expr else {
            panic!("expected sequence");
        };
        assert_eq!(terms[0], Expr::RuleRef("Greeting".into()));
        assert_eq!(terms[1], Expr::SlotRef("name".into()));
    }

    #[test]
    fn parses_full_grammar() {
        let text = "\
#JSGF V1.0 UTF-8 en;
grammar ChangeLightState;

public <ChangeLightState> = (turn [the] (kitchen | bedroom){name} light (on | off){state});
<color> = (red | green | blue);
";
        let grammar = parse_grammar(text).unwrap();
        assert_eq!(grammar.name, "ChangeLightState");
        assert_eq!(grammar.public_rule, "ChangeLightState");
        assert_eq!(grammar.rules.len(), 2);
        assert!(grammar.rules.contains_key("color"));
    }

    #[test]
    fn rejects_unbalanced_brackets() {
        assert!(parse_expr("turn (on | off the light").is_err());
        assert!(parse_expr("turn on ] the light").is_err());
    }

    #[test]
    fn missing_public_rule_is_an_error() {
        let text = "grammar Foo;\n<bar> = (a | b);\n";
        assert!(parse_grammar(text).is_err());
    }
}
