//! Corpus synthesis from product fields.
//!
//! Every product is embedded through a single sentence template so that the
//! text produced during a bulk build and the text produced by a single
//! add/update are byte-identical:
//!
//! ```text
//! This product is a {name} from the brand {brand}. It falls under the category of
//! {categories} and contains ingredients such as {ingredients}. It is manufactured by
//! {manufacturer} (manufacturer code: {manufacturerNumber}).
//! ```
//!
//! All fields are whitespace-normalized; everything except name and brand is
//! lower-cased.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\p{Cc}]+").unwrap());

/// Borrowed view over the six attributes the corpus is built from.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorpusFields<'a> {
    pub name: &'a str,
    pub brand: &'a str,
    pub categories: &'a str,
    pub ingredients: &'a str,
    pub manufacturer: &'a str,
    pub manufacturer_number: &'a str,
}

/// Collapse control characters and whitespace runs into single spaces and trim.
///
/// Placeholder values left over from tabular exports ("nan", "None") render as
/// an empty string.
pub fn normalize_text(text: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(text, " ");
    let trimmed = collapsed.trim();

    if trimmed.eq_ignore_ascii_case("nan") || trimmed == "None" {
        return String::new();
    }

    trimmed.to_string()
}

/// Build the corpus text for a product.
pub fn build_corpus(fields: &CorpusFields<'_>) -> String {
    let name = normalize_text(fields.name);
    let brand = normalize_text(fields.brand);
    let categories = normalize_text(fields.categories).to_lowercase();
    let ingredients = normalize_text(fields.ingredients).to_lowercase();
    let manufacturer = normalize_text(fields.manufacturer).to_lowercase();
    let manufacturer_number = normalize_text(fields.manufacturer_number).to_lowercase();

    format!(
        "This product is a {name} from the brand {brand}. \
         It falls under the category of {categories} and contains ingredients such as {ingredients}. \
         It is manufactured by {manufacturer} (manufacturer code: {manufacturer_number})."
    )
}

/// Stable hash of a corpus string, stored next to its embedding so stale
/// vectors can be detected after a crash.
pub fn content_hash(corpus: &str) -> u64 {
    let digest = Sha256::digest(corpus.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields<'a>(name: &'a str, brand: &'a str) -> CorpusFields<'a> {
        CorpusFields {
            name,
            brand,
            ..Default::default()
        }
    }

    #[test]
    fn test_template_layout() {
        let corpus = build_corpus(&CorpusFields {
            name: "Dark Chocolate Bar",
            brand: "CocoaCo",
            categories: "Snacks, Candy",
            ingredients: "Cocoa Mass, Sugar",
            manufacturer: "Cocoa Inc",
            manufacturer_number: "AB-12",
        });

        assert_eq!(
            corpus,
            "This product is a Dark Chocolate Bar from the brand CocoaCo. \
             It falls under the category of snacks, candy and contains ingredients such as cocoa mass, sugar. \
             It is manufactured by cocoa inc (manufacturer code: ab-12)."
        );
    }

    #[test]
    fn test_missing_fields_render_empty() {
        let corpus = build_corpus(&fields("Bread", "HealthCo"));
        assert!(corpus.contains("category of  and"));
        assert!(corpus.contains("(manufacturer code: )."));
        assert!(!corpus.contains("None"));
    }

    #[test]
    fn test_placeholder_values_are_dropped() {
        assert_eq!(normalize_text("nan"), "");
        assert_eq!(normalize_text(" NaN "), "");
        assert_eq!(normalize_text("None"), "");
        assert_eq!(normalize_text("Nonesuch"), "Nonesuch");
    }

    #[test]
    fn test_whitespace_and_control_runs_collapse() {
        assert_eq!(normalize_text("  a\u{a0}\n\r\tb   c \u{7} d  "), "a b c d");
    }

    #[test]
    fn test_name_and_brand_keep_case() {
        let corpus = build_corpus(&fields("  Quinoa\tBread ", "HealthCo"));
        assert!(corpus.starts_with("This product is a Quinoa Bread from the brand HealthCo."));
    }

    #[test]
    fn test_corpus_is_idempotent() {
        let a = build_corpus(&fields("Vanilla Protein Powder", "FitCo"));
        let b = build_corpus(&fields("Vanilla Protein Powder", "FitCo"));
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_content_hash_differs_for_different_corpus() {
        assert_ne!(content_hash("a"), content_hash("b"));
    }
}
