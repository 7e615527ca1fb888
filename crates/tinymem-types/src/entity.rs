//! Canonical entity references.
//!
//! An entity is a stable reference to a code symbol at a filepath, written
//! `filepath::symbol`. The filepath may be the literal `unknown` when the
//! resolver could prove a symbol but was given no path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TinyMemError;

/// Placeholder filepath for entities resolved without a path hint.
pub const UNKNOWN_FILEPATH: &str = "unknown";

/// A `filepath::symbol` reference. Parsed on the first `::`, so filepaths
/// may not contain the separator but symbols may (e.g. Rust paths).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
    filepath: String,
    symbol: String,
}

impl EntityKey {
    /// Build a key from its two halves, validating both are non-empty.
    pub fn new(
        filepath: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Result<Self, TinyMemError> {
        let filepath = filepath.into();
        let symbol = symbol.into();
        if filepath.trim().is_empty() || symbol.trim().is_empty() {
            return Err(TinyMemError::InvalidEntityKey(format!(
                "{filepath}::{symbol}"
            )));
        }
        Ok(Self { filepath, symbol })
    }

    /// Build a key for a symbol with no known filepath.
    pub fn unknown(symbol: impl Into<String>) -> Result<Self, TinyMemError> {
        Self::new(UNKNOWN_FILEPATH, symbol)
    }

    /// The filepath half.
    pub fn filepath(&self) -> &str {
        &self.filepath
    }

    /// The symbol half.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Whether the key carries a real filepath rather than the placeholder.
    pub fn has_real_filepath(&self) -> bool {
        self.filepath != UNKNOWN_FILEPATH
    }
}

impl FromStr for EntityKey {
    type Err = TinyMemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (filepath, symbol) = s
            .split_once("::")
            .ok_or_else(|| TinyMemError::InvalidEntityKey(s.to_string()))?;
        Self::new(filepath, symbol)
    }
}

impl TryFrom<String> for EntityKey {
    type Error = TinyMemError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.filepath, self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_on_first_separator() {
        let key: EntityKey = "x.go::Alpha".parse().unwrap();
        assert_eq!(key.filepath(), "x.go");
        assert_eq!(key.symbol(), "Alpha");

        // A symbol may itself contain the separator.
        let key: EntityKey = "src/lib.rs::vault::store".parse().unwrap();
        assert_eq!(key.filepath(), "src/lib.rs");
        assert_eq!(key.symbol(), "vault::store");
    }

    #[test]
    fn rejects_missing_or_empty_halves() {
        assert!("Alpha".parse::<EntityKey>().is_err());
        assert!("::Alpha".parse::<EntityKey>().is_err());
        assert!("x.go::".parse::<EntityKey>().is_err());
    }

    #[test]
    fn unknown_keys_are_marked() {
        let key = EntityKey::unknown("Alpha").unwrap();
        assert_eq!(key.to_string(), "unknown::Alpha");
        assert!(!key.has_real_filepath());
        assert!("x.go::Alpha".parse::<EntityKey>().unwrap().has_real_filepath());
    }

    #[test]
    fn serde_uses_the_wire_form() {
        let key: EntityKey = "x.go::Alpha".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"x.go::Alpha\"");
        let back: EntityKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
