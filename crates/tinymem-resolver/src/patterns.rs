//! The regex stage: an embedded pattern catalogue keyed by language.
//!
//! The catalogue is a JSON document compiled once on first use. Each
//! pattern carries a capture group index and its own confidence tag:
//! anchored declaration forms are tagged CONFIRMED, looser binding forms
//! INFERRED. A symbol captured by any CONFIRMED pattern keeps CONFIRMED
//! even if an INFERRED pattern also matched it.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use tinymem_types::Confidence;

use crate::language::Language;

const CATALOGUE_JSON: &str = include_str!("patterns.json");

#[derive(Debug, Deserialize)]
struct RawPattern {
    pattern: String,
    group: usize,
    confidence: String,
}

struct CompiledPattern {
    regex: Regex,
    group: usize,
    confidence: Confidence,
}

static CATALOGUE: Lazy<HashMap<String, Vec<CompiledPattern>>> = Lazy::new(|| {
    let raw: HashMap<String, Vec<RawPattern>> = match serde_json::from_str(CATALOGUE_JSON) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "embedded pattern catalogue is malformed");
            return HashMap::new();
        }
    };
    raw.into_iter()
        .map(|(language, patterns)| {
            let compiled = patterns
                .into_iter()
                .filter_map(|p| {
                    let regex = match Regex::new(&p.pattern) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(pattern = %p.pattern, error = %e, "skipping bad pattern");
                            return None;
                        }
                    };
                    let confidence = match p.confidence.as_str() {
                        "CONFIRMED" => Confidence::Confirmed,
                        _ => Confidence::Inferred,
                    };
                    Some(CompiledPattern {
                        regex,
                        group: p.group,
                        confidence,
                    })
                })
                .collect();
            (language, compiled)
        })
        .collect()
});

/// Union of captured symbols for one language, each with the best
/// confidence any pattern assigned it. Source order of first capture is
/// preserved.
#[derive(Debug, Default, PartialEq)]
pub struct PatternMatches {
    /// (symbol, best confidence), in first-capture order.
    pub symbols: Vec<(String, Confidence)>,
}

impl PatternMatches {
    /// Symbols captured at CONFIRMED.
    pub fn confirmed(&self) -> Vec<&str> {
        self.symbols
            .iter()
            .filter(|(_, c)| *c == Confidence::Confirmed)
            .map(|(s, _)| s.as_str())
            .collect()
    }

    /// All captured symbol names.
    pub fn names(&self) -> Vec<String> {
        self.symbols.iter().map(|(s, _)| s.clone()).collect()
    }
}

/// Run every catalogue pattern for `language` over `content`. A language
/// with no catalogue entry (including unknown) yields no matches, which
/// sends the pipeline on to correlation.
pub fn scan(language: Language, content: &str) -> PatternMatches {
    let mut matches = PatternMatches::default();
    let Some(patterns) = CATALOGUE.get(language.as_str()) else {
        return matches;
    };

    for pattern in patterns {
        for captures in pattern.regex.captures_iter(content) {
            let Some(symbol) = captures.get(pattern.group) else {
                continue;
            };
            let symbol = symbol.as_str();
            if let Some(entry) = matches.symbols.iter_mut().find(|(s, _)| s == symbol) {
                // Promote, never demote.
                if pattern.confidence == Confidence::Confirmed {
                    entry.1 = Confidence::Confirmed;
                }
            } else {
                matches
                    .symbols
                    .push((symbol.to_string(), pattern.confidence));
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_declarations_are_confirmed() {
        let matches = scan(Language::Go, "func Alpha() {}\ntype Beta struct{}\n");
        assert_eq!(matches.confirmed(), vec!["Alpha", "Beta"]);
    }

    #[test]
    fn go_short_assignment_is_only_inferred() {
        let matches = scan(Language::Go, "result := compute()\n");
        assert_eq!(
            matches.symbols,
            vec![("result".to_string(), Confidence::Inferred)]
        );
    }

    #[test]
    fn confirmed_wins_over_inferred_for_the_same_symbol() {
        // `Alpha` appears both as a declaration and a := binding.
        let matches = scan(Language::Go, "func Alpha() {}\n\nfunc use() { Alpha := 1; _ = Alpha }\n");
        let alpha = matches.symbols.iter().find(|(s, _)| s == "Alpha").unwrap();
        assert_eq!(alpha.1, Confidence::Confirmed);
    }

    #[test]
    fn rust_items_are_confirmed() {
        let matches = scan(
            Language::Rust,
            "pub async fn fetch() {}\npub(crate) struct Cache;\nconst LIMIT: u8 = 1;\n",
        );
        assert_eq!(matches.confirmed(), vec!["fetch", "Cache", "LIMIT"]);
    }

    #[test]
    fn unknown_language_has_no_patterns() {
        let matches = scan(Language::Unknown, "Alpha()");
        assert!(matches.symbols.is_empty());
    }

    #[test]
    fn javascript_exported_forms() {
        let matches = scan(
            Language::JavaScript,
            "export function render() {}\nexport const state = {};\n",
        );
        assert_eq!(matches.confirmed(), vec!["render"]);
        assert_eq!(matches.names(), vec!["render", "state"]);
    }
}
