//! Pronoun and implicit-reference detection.

use crate::fuzzy::normalize;

const PRONOUNS: &[&str] = &[
    "him", "her", "he", "she", "his", "hers", "them", "they", "their", "theirs",
    "same person", "that person", "them again",
];

/// How a command names its contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactRef<'a> {
    /// A name to resolve against the directory.
    Named(&'a str),
    /// Omitted or a pronoun; falls back to the session's last contact.
    Implicit,
}

/// True if the whole string is a pronoun or back-reference.
#[must_use]
pub fn is_pronoun(word: &str) -> bool {
    let word = normalize(word);
    PRONOUNS.contains(&word.as_str())
}

/// True if the text mentions a pronoun anywhere as a word.
#[must_use]
pub fn mentions_pronoun(text: &str) -> bool {
    normalize(text)
        .split(' ')
        .any(|token| PRONOUNS.contains(&token))
}

/// Classify the contact field of a hint.
#[must_use]
pub fn classify(contact: Option<&str>) -> ContactRef<'_> {
    match contact.map(str::trim) {
        None | Some("") => ContactRef::Implicit,
        Some(name) if is_pronoun(name) => ContactRef::Implicit,
        Some(name) => ContactRef::Named(name),
    }
}
