//! AST extraction: parse with the language's tree-sitter grammar and pull
//! out the top-level declarations.
//!
//! A parse failure here is a hard failure of this stage, surfaced as an
//! error so the pipeline falls through to the regex catalogue. It is never
//! silently degraded into an empty symbol list: an empty list means the
//! parse *succeeded* and the artifact genuinely declares nothing.

use tracing::debug;
use tree_sitter::{Node, Parser};

use tinymem_types::{Result, TinyMemError};

use crate::language::Language;

/// Symbols and node count pulled from a successful parse.
#[derive(Debug, Clone, PartialEq)]
pub struct AstExtraction {
    /// Top-level declaration names, in source order.
    pub symbols: Vec<String>,
    /// Total number of AST nodes, used for parity checks at promotion.
    pub node_count: i64,
}

/// Parse `content` with the grammar for `language` and extract top-level
/// declarations. Errors when the language has no grammar or the parse
/// produced error nodes.
pub fn extract(language: Language, content: &str) -> Result<AstExtraction> {
    let grammar = match language {
        Language::Go => tree_sitter_go::language(),
        Language::Rust => tree_sitter_rust::language(),
        Language::Python => tree_sitter_python::language(),
        Language::JavaScript => tree_sitter_javascript::language(),
        Language::Unknown => {
            return Err(TinyMemError::ResolutionFailed(
                "no grammar for unknown language".to_string(),
            ))
        }
    };

    let mut parser = Parser::new();
    parser
        .set_language(grammar)
        .map_err(|e| TinyMemError::ResolutionFailed(format!("grammar load: {e}")))?;

    let tree = parser
        .parse(content, None)
        .ok_or_else(|| TinyMemError::ResolutionFailed("parser returned no tree".to_string()))?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(TinyMemError::ResolutionFailed(format!(
            "{} parse produced error nodes",
            language.as_str()
        )));
    }

    let source = content.as_bytes();
    let mut symbols = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        collect_declaration(language, child, source, &mut symbols);
    }

    let node_count = count_nodes(root);
    debug!(
        language = language.as_str(),
        symbols = symbols.len(),
        node_count,
        "ast extraction complete"
    );
    Ok(AstExtraction {
        symbols,
        node_count,
    })
}

/// Count every node in the tree, named and anonymous alike.
fn count_nodes(node: Node<'_>) -> i64 {
    let mut count = 1;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        count += count_nodes(child);
    }
    count
}

fn collect_declaration(
    language: Language,
    node: Node<'_>,
    source: &[u8],
    symbols: &mut Vec<String>,
) {
    match language {
        Language::Go => collect_go(node, source, symbols),
        Language::Rust => collect_rust(node, source, symbols),
        Language::Python => collect_python(node, source, symbols),
        Language::JavaScript => collect_javascript(node, source, symbols),
        Language::Unknown => {}
    }
}

fn push_name(node: Node<'_>, source: &[u8], symbols: &mut Vec<String>) {
    if let Some(name) = node.child_by_field_name("name") {
        if let Ok(text) = name.utf8_text(source) {
            symbols.push(text.to_string());
        }
    }
}

fn collect_go(node: Node<'_>, source: &[u8], symbols: &mut Vec<String>) {
    match node.kind() {
        "function_declaration" | "method_declaration" => push_name(node, source, symbols),
        "type_declaration" => {
            let mut cursor = node.walk();
            for spec in node.named_children(&mut cursor) {
                if spec.kind() == "type_spec" {
                    push_name(spec, source, symbols);
                }
            }
        }
        "const_declaration" | "var_declaration" => {
            let mut cursor = node.walk();
            for spec in node.named_children(&mut cursor) {
                if matches!(spec.kind(), "const_spec" | "var_spec") {
                    push_name(spec, source, symbols);
                }
            }
        }
        _ => {}
    }
}

fn collect_rust(node: Node<'_>, source: &[u8], symbols: &mut Vec<String>) {
    match node.kind() {
        "function_item" | "struct_item" | "enum_item" | "trait_item" | "union_item"
        | "const_item" | "static_item" | "type_item" | "mod_item" | "macro_definition" => {
            push_name(node, source, symbols)
        }
        _ => {}
    }
}

fn collect_python(node: Node<'_>, source: &[u8], symbols: &mut Vec<String>) {
    match node.kind() {
        "function_definition" | "class_definition" => push_name(node, source, symbols),
        "decorated_definition" => {
            if let Some(inner) = node.child_by_field_name("definition") {
                collect_python(inner, source, symbols);
            }
        }
        _ => {}
    }
}

fn collect_javascript(node: Node<'_>, source: &[u8], symbols: &mut Vec<String>) {
    match node.kind() {
        "function_declaration" | "generator_function_declaration" | "class_declaration" => {
            push_name(node, source, symbols)
        }
        "lexical_declaration" | "variable_declaration" => {
            let mut cursor = node.walk();
            for declarator in node.named_children(&mut cursor) {
                if declarator.kind() == "variable_declarator" {
                    push_name(declarator, source, symbols);
                }
            }
        }
        "export_statement" => {
            if let Some(decl) = node.child_by_field_name("declaration") {
                collect_javascript(decl, source, symbols);
            }
        }
        _ => {}
    }
}
