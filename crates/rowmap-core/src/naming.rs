//! Field name to column name conversion.

use std::sync::OnceLock;

use regex::Regex;

fn word_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(.)([A-Z][a-z]+)").expect("valid word boundary pattern"))
}

fn case_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-z0-9])([A-Z])").expect("valid case boundary pattern"))
}

/// Convert a CamelCase (or already snake_case) identifier to snake_case.
///
/// Acronyms stay together: `HTTPServer` becomes `http_server` and
/// `DefaultRefcodeID` becomes `default_refcode_id`.
pub fn to_snake_case(name: &str) -> String {
    let split = word_boundary().replace_all(name, "${1}_${2}");
    let split = case_boundary().replace_all(&split, "${1}_${2}");
    split.to_lowercase()
}
