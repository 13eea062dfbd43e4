//! Token and keyword extraction shared by chunking, indexing and retrieval.
//!
//! Tokens are lowercased alphanumeric runs longer than two characters that
//! are not on the stop-word list. Everything here is pure and deterministic.

use std::collections::{BTreeSet, HashMap};

/// Minimum length (in characters) a token must exceed to be kept.
const MIN_TOKEN_CHARS: usize = 2;

/// Tokens at least this long participate in prefix matching.
pub const PREFIX_MATCH_MIN_CHARS: usize = 5;

/// Common English words that carry no retrieval signal.
const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "all", "also", "and", "any", "are",
    "because", "been", "before", "being", "below", "between", "both", "but",
    "can", "could", "did", "does", "doing", "down", "during", "each", "few",
    "for", "from", "further", "had", "has", "have", "having", "her", "here",
    "hers", "herself", "him", "himself", "his", "how", "into", "its",
    "itself", "just", "like", "more", "most", "not", "now", "off", "once",
    "only", "other", "our", "ours", "out", "over", "own", "same", "she",
    "should", "some", "such", "than", "that", "the", "their", "theirs",
    "them", "then", "there", "these", "they", "this", "those", "through",
    "too", "under", "until", "very", "was", "were", "what", "when", "where",
    "which", "while", "who", "whom", "why", "will", "with", "would", "you",
    "your", "yours",
];

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// Iterate over every kept token in order, including repeats.
fn token_stream(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|raw| raw.chars().count() > MIN_TOKEN_CHARS)
        .map(str::to_lowercase)
        .filter(|token| !is_stop_word(token))
}

/// Split text into its set of distinct, lowercased tokens.
///
/// # Examples
///
/// ```
/// use ragweave::tokenizer::tokenize;
///
/// let tokens = tokenize("The Rust compiler, the RUST book!");
/// assert!(tokens.contains("rust"));
/// assert!(tokens.contains("compiler"));
/// assert!(!tokens.contains("the"));
/// ```
pub fn tokenize(text: &str) -> BTreeSet<String> {
    token_stream(text).collect()
}

/// Return the `limit` most frequent tokens of `text`.
///
/// Ordered by descending frequency; ties are broken alphabetically so the
/// output is exactly reproducible.
///
/// # Examples
///
/// ```
/// use ragweave::tokenizer::extract_keywords;
///
/// assert_eq!(
///     extract_keywords("swift swift swift coding coding testing", 3),
///     vec!["swift", "coding", "testing"]
/// );
/// assert_eq!(
///     extract_keywords("banana apple cherry", 3),
///     vec!["apple", "banana", "cherry"]
/// );
/// ```
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in token_stream(text) {
        *counts.entry(token).or_default() += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(a_token, a_count), (b_token, b_count)| {
        b_count.cmp(a_count).then_with(|| a_token.cmp(b_token))
    });

    ranked
        .into_iter()
        .take(limit)
        .map(|(token, _)| token)
        .collect()
}

/// True when both tokens are at least `min_chars` long and one is a prefix
/// of the other ("retriev" / "retrieval").
pub fn is_prefix_variant(a: &str, b: &str, min_chars: usize) -> bool {
    if a.chars().count() < min_chars || b.chars().count() < min_chars {
        return false;
    }
    a.starts_with(b) || b.starts_with(a)
}

/// Normalized token overlap between a query and a chunk's token set.
///
/// Each query token earns 1.0 for an exact hit, otherwise 0.5 for the
/// first prefix variant found. The sum is divided by the query token count.
pub fn overlap_score(
    query_tokens: &BTreeSet<String>,
    target_tokens: &BTreeSet<String>,
    prefix_min_chars: usize,
) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }

    let mut total = 0.0f32;
    for token in query_tokens {
        if target_tokens.contains(token) {
            total += 1.0;
        } else if token.chars().count() >= prefix_min_chars
            && target_tokens
                .iter()
                .any(|t| is_prefix_variant(token, t, prefix_min_chars))
        {
            total += 0.5;
        }
    }

    total / query_tokens.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_words_are_sorted_for_binary_search() {
        let mut sorted = STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOP_WORDS);
    }

    #[test]
    fn tokenize_lowercases_and_filters() {
        let tokens = tokenize("An API for the Swift-UI framework: on iOS 17");
        assert!(tokens.contains("api"));
        assert!(tokens.contains("swift"));
        assert!(tokens.contains("framework"));
        assert!(tokens.contains("ios"));
        // Too short.
        assert!(!tokens.contains("an"));
        assert!(!tokens.contains("ui"));
        assert!(!tokens.contains("17"));
        // Stop word.
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("for"));
    }

    #[test]
    fn tokenize_handles_unicode() {
        let tokens = tokenize("Café naïve 日本語テキスト");
        assert!(tokens.contains("café"));
        assert!(tokens.contains("naïve"));
    }

    #[test]
    fn tokenize_empty_text() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("a an of to").is_empty());
    }

    #[test]
    fn keywords_ordered_by_frequency() {
        assert_eq!(
            extract_keywords("swift swift swift coding coding testing", 3),
            vec!["swift", "coding", "testing"]
        );
    }

    #[test]
    fn keyword_ties_break_alphabetically() {
        assert_eq!(
            extract_keywords("banana apple cherry", 3),
            vec!["apple", "banana", "cherry"]
        );
    }

    #[test]
    fn keyword_limit_truncates() {
        assert_eq!(
            extract_keywords("delta delta alpha beta gamma", 2),
            vec!["delta", "alpha"]
        );
        assert!(extract_keywords("delta alpha", 0).is_empty());
    }

    #[test]
    fn prefix_variants_need_min_length() {
        assert!(is_prefix_variant("retriev", "retrieval", 5));
        assert!(is_prefix_variant("retrieval", "retriev", 5));
        assert!(!is_prefix_variant("rust", "rusty", 5));
        assert!(!is_prefix_variant("index", "indices", 5));
    }

    #[test]
    fn overlap_scores_exact_and_prefix_hits() {
        let query = tokenize("embedding retrieval");
        let target = tokenize("embeddings make retrieval fast");
        // "retrieval" exact (1.0), "embedding" prefix of "embeddings" (0.5).
        let score = overlap_score(&query, &target, 5);
        assert!((score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn overlap_of_empty_query_is_zero() {
        let target = tokenize("anything here");
        assert_eq!(overlap_score(&BTreeSet::new(), &target, 5), 0.0);
    }
}
