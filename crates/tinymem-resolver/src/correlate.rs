//! The correlation stage: align an otherwise-unresolved artifact with an
//! entity already in the state map by symbol overlap.
//!
//! Correlation never introduces a new entity and never emits CONFIRMED.
//! It needs a clear winner: the best overlap must reach the threshold and
//! strictly beat the runner-up, otherwise the artifact stays unresolved.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use tinymem_types::EntityKey;

/// Minimum fraction of an entity's symbols that must appear in the
/// artifact before correlation will claim alignment.
pub const OVERLAP_THRESHOLD: f64 = 0.5;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]{3,}").expect("static pattern"));

/// An entity currently in the state map together with the symbols of its
/// governing artifact.
#[derive(Debug, Clone)]
pub struct KnownEntity {
    /// The entity key.
    pub entity_key: EntityKey,
    /// Symbols of the entity's current artifact.
    pub symbols: Vec<String>,
}

/// Pick the single best-overlapping entity, if any qualifies.
pub fn correlate(content: &str, entities: &[KnownEntity]) -> Option<(EntityKey, f64)> {
    let words: HashSet<&str> = WORD.find_iter(content).map(|m| m.as_str()).collect();
    if words.is_empty() {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    let mut second_best = 0.0_f64;
    for (index, entity) in entities.iter().enumerate() {
        if entity.symbols.is_empty() {
            continue;
        }
        let matched = entity
            .symbols
            .iter()
            .filter(|s| words.contains(s.as_str()))
            .count();
        let overlap = matched as f64 / entity.symbols.len() as f64;
        match best {
            Some((_, best_overlap)) if overlap > best_overlap => {
                second_best = best_overlap;
                best = Some((index, overlap));
            }
            Some(_) => {
                if overlap > second_best {
                    second_best = overlap;
                }
            }
            None => best = Some((index, overlap)),
        }
    }

    let (index, overlap) = best?;
    if overlap >= OVERLAP_THRESHOLD && overlap > second_best {
        Some((entities[index].entity_key.clone(), overlap))
    } else {
        None
    }
}
