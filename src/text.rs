//! Lightweight chat-message helpers.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Words dropped by [`extract_keywords`].
pub const STOP_WORDS: [&str; 10] = ["ir", "kad", "su", "be", "per", "and", "the", "is", "in", "to"];

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("static word pattern compiles"))
}

fn punctuation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s]").expect("static punctuation pattern compiles"))
}

/// Lowercased word tokens.
///
/// ```
/// assert_eq!(termai::text::tokenize("Labas, TermAi!"), vec!["labas", "termai"]);
/// ```
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    word_regex()
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Lowercases, strips punctuation and trims surrounding whitespace.
#[must_use]
pub fn preprocess_message(message: &str) -> String {
    punctuation_regex()
        .replace_all(&message.to_lowercase(), "")
        .trim()
        .to_string()
}

/// Whether the message asks something.
#[must_use]
pub fn is_question(message: &str) -> bool {
    message.contains('?')
}

/// Tokens longer than two characters that are not stop words.
#[must_use]
pub fn extract_keywords(message: &str) -> Vec<String> {
    tokenize(message)
        .into_iter()
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Jaccard similarity of the two messages' token sets; `0.0` when both are empty.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = tokenize(a).into_iter().collect();
    let right: HashSet<String> = tokenize(b).into_iter().collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}
