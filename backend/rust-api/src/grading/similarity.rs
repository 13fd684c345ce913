use std::collections::HashSet;
use tree_sitter::{Language, Node, Parser};

/// Structural similarity between two programs: Jaccard overlap of the sets of
/// syntax-node kinds in their parse trees. Insensitive to identifiers and
/// ordering, which is exactly what we want for comparing a student's approach
/// against the ideal solution.
///
/// Returns `None` for unsupported languages or code that fails to parse, so
/// the caller can fall back to a semantic-only judgment.
pub fn structural_similarity(language: &str, a: &str, b: &str) -> Option<f64> {
    let lang = grammar_for(language)?;
    let kinds_a = node_kinds(&lang, a)?;
    let kinds_b = node_kinds(&lang, b)?;

    if kinds_a.is_empty() && kinds_b.is_empty() {
        return Some(1.0);
    }

    let intersection = kinds_a.intersection(&kinds_b).count();
    let union = kinds_a.union(&kinds_b).count();
    if union == 0 {
        return Some(0.0);
    }
    Some(intersection as f64 / union as f64)
}

fn grammar_for(language: &str) -> Option<Language> {
    match language.to_lowercase().as_str() {
        "python" | "python3" => Some(tree_sitter_python::LANGUAGE.into()),
        "javascript" | "js" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        _ => None,
    }
}

fn node_kinds(lang: &Language, source: &str) -> Option<HashSet<String>> {
    let mut parser = Parser::new();
    parser.set_language(lang).ok()?;
    let tree = parser.parse(source, None)?;

    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut kinds = HashSet::new();
    collect_kinds(root, &mut kinds);
    Some(kinds)
}

fn collect_kinds(node: Node, kinds: &mut HashSet<String>) {
    if node.is_named() {
        kinds.insert(node.kind().to_string());
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_kinds(child, kinds);
    }
}
