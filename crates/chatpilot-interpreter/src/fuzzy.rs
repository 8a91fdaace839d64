//! Fuzzy contact resolution.
//!
//! A query is scored against every directory entry. The unique best entry
//! above `min_confidence` wins; anything scoring within `tie_margin` of the
//! best makes the query ambiguous, and the matcher refuses to pick.

use chatpilot_core::MatchPolicy;
use thiserror::Error;

/// Shortest query allowed to win on a prefix alone.
const MIN_PREFIX_LEN: usize = 2;
/// Score when the entry is a whole word of the query ("john smith" vs "John").
const CONTAINED_SCORE: f64 = 0.7;
/// Guards float comparisons at the tie boundary.
const EPSILON: f64 = 1e-9;

/// Resolution failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    #[error("'{query}' could refer to {}", candidates.join(", "))]
    Ambiguous {
        query: String,
        candidates: Vec<String>,
    },
    #[error("no contact matches '{query}'")]
    Unresolved { query: String },
}

/// Scored directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub score: f64,
}

/// Lowercase, turn punctuation into spaces, collapse whitespace.
#[must_use]
pub fn normalize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, a_ch) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, b_ch) in b_chars.iter().enumerate() {
            let cost = usize::from(a_ch != b_ch);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn edit_similarity(q: &str, e: &str) -> f64 {
    let longest = q.chars().count().max(e.chars().count());
    1.0 - ratio(levenshtein_distance(q, e), longest)
}

fn token_overlap(q: &str, e: &str) -> f64 {
    let q_tokens: Vec<&str> = q.split(' ').collect();
    let e_tokens: Vec<&str> = e.split(' ').collect();
    let shared = q_tokens.iter().filter(|t| e_tokens.contains(t)).count();
    let union = q_tokens.len() + e_tokens.len() - shared;
    ratio(shared, union)
}

fn prefix_score(q: &str, e: &str) -> f64 {
    let q_len = q.chars().count();
    if q_len < MIN_PREFIX_LEN {
        return 0.0;
    }
    if e.starts_with(q) {
        return 0.35f64.mul_add(ratio(q_len, e.chars().count()), 0.6);
    }
    e.split(' ')
        .skip(1)
        .filter(|token| token.starts_with(q))
        .map(|token| 0.35f64.mul_add(ratio(q_len, token.chars().count()), 0.55))
        .fold(0.0, f64::max)
}

/// Similarity of a query to a directory entry, in `0.0..=1.0`.
///
/// The score is the best of: normalized edit similarity, token overlap,
/// prefix strength, and whole-word containment. Exact matches (after
/// normalization) score 1.0.
#[must_use]
pub fn score(query: &str, entry: &str) -> f64 {
    let q = normalize(query);
    let e = normalize(entry);
    if q.is_empty() || e.is_empty() {
        return 0.0;
    }
    if q == e {
        return 1.0;
    }

    let contained = if q.split(' ').any(|token| token == e) {
        CONTAINED_SCORE
    } else {
        0.0
    };

    edit_similarity(&q, &e)
        .max(token_overlap(&q, &e))
        .max(prefix_score(&q, &e))
        .max(contained)
}

/// Resolves noisy names against a directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContactMatcher {
    policy: MatchPolicy,
}

impl ContactMatcher {
    /// Create a matcher with the given policy.
    #[must_use]
    pub const fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    /// Policy in use.
    #[must_use]
    pub const fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Score every entry, best first. Ties keep directory order.
    #[must_use]
    pub fn rank<'a>(&self, query: &str, directory: &'a [String]) -> Vec<Candidate<'a>> {
        let mut ranked: Vec<Candidate<'a>> = directory
            .iter()
            .map(|name| Candidate {
                name: name.as_str(),
                score: score(query, name),
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    /// Resolve a query to exactly one directory entry.
    ///
    /// # Errors
    /// `Unresolved` if nothing reaches `min_confidence`; `Ambiguous` if more
    /// than one entry scores within `tie_margin` of the best.
    pub fn resolve<'a>(&self, query: &str, directory: &'a [String]) -> Result<&'a str, MatchError> {
        let ranked = self.rank(query, directory);

        let Some(best) = ranked.first() else {
            return Err(MatchError::Unresolved {
                query: query.to_string(),
            });
        };
        if best.score + EPSILON < self.policy.min_confidence {
            tracing::debug!(query, best = best.name, score = best.score, "No contact above threshold");
            return Err(MatchError::Unresolved {
                query: query.to_string(),
            });
        }

        let floor = best.score - self.policy.tie_margin - EPSILON;
        let contenders: Vec<&Candidate<'a>> = ranked.iter().filter(|c| c.score >= floor).collect();
        if contenders.len() > 1 {
            return Err(MatchError::Ambiguous {
                query: query.to_string(),
                candidates: contenders.iter().map(|c| c.name.to_string()).collect(),
            });
        }

        Ok(best.name)
    }
}
