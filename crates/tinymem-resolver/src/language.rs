//! Language detection: filepath extension first, then a conservative
//! content heuristic, else unknown.

use serde::{Deserialize, Serialize};

/// Languages the AST stage can parse. Anything else resolves through the
/// regex catalogue or correlation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// Go.
    Go,
    /// Rust.
    Rust,
    /// Python.
    Python,
    /// JavaScript (TypeScript files are parsed with this grammar for
    /// top-level shape).
    JavaScript,
    /// Not detected; the AST stage is skipped.
    Unknown,
}

impl Language {
    /// Catalogue key for the regex stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Unknown => "unknown",
        }
    }

    /// Whether the AST stage has a grammar for this language.
    pub fn has_grammar(&self) -> bool {
        !matches!(self, Language::Unknown)
    }
}

/// Detect the language of an artifact.
pub fn detect(filepath: Option<&str>, content: &str) -> Language {
    if let Some(path) = filepath {
        if let Some(by_ext) = detect_by_extension(path) {
            return by_ext;
        }
    }
    detect_by_content(content)
}

fn detect_by_extension(path: &str) -> Option<Language> {
    let ext = path.rsplit('.').next()?;
    match ext {
        "go" => Some(Language::Go),
        "rs" => Some(Language::Rust),
        "py" | "pyi" => Some(Language::Python),
        "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => Some(Language::JavaScript),
        _ => None,
    }
}

/// Conservative content sniffing. Requires two independent signals before
/// claiming a language; otherwise unknown, which keeps the AST stage out of
/// content it would misparse.
fn detect_by_content(content: &str) -> Language {
    let signals = |needles: &[&str]| -> usize {
        needles.iter().filter(|n| content.contains(*n)).count()
    };

    if signals(&["package ", "func ", ":= ", "import ("]) >= 2 {
        return Language::Go;
    }
    if signals(&["fn ", "let ", "impl ", "pub ", "use "]) >= 2 {
        return Language::Rust;
    }
    if signals(&["def ", "self", "import ", "elif "]) >= 2 {
        return Language::Python;
    }
    if signals(&["function ", "=> ", "const ", "module.exports"]) >= 2 {
        return Language::JavaScript;
    }
    Language::Unknown
}
