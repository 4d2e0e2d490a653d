//! Fuzzy name matching.

use strsim::levenshtein;

/// Similarity threshold above which a match counts as strong.
pub const STRONG_MATCH: f64 = 0.9;
/// Similarity floor for suggest-only matches.
pub const SUGGEST_MATCH: f64 = 0.7;

/// Levenshtein similarity: `1 - distance / max(|a|, |b|)`.
///
/// Substring containment on either side (length >= 4) short-circuits to 0.9
/// so "charizard" matches "dark charizard" without paying the distance of
/// the prefix.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let shorter = a.len().min(b.len());
    if shorter >= 4 && (a.contains(b) || b.contains(a)) {
        return STRONG_MATCH;
    }

    let distance = levenshtein(a, b);
    let longer = a.chars().count().max(b.chars().count());
    1.0 - distance as f64 / longer as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_one() {
        assert_eq!(similarity("pikachu", "pikachu"), 1.0);
    }

    #[test]
    fn empty_scores_zero() {
        assert_eq!(similarity("", "pikachu"), 0.0);
    }

    #[test]
    fn containment_scores_strong() {
        assert_eq!(similarity("charizard", "dark charizard"), STRONG_MATCH);
        assert_eq!(similarity("dark charizard", "charizard"), STRONG_MATCH);
    }

    #[test]
    fn short_containment_does_not_short_circuit() {
        // "cha" is under the containment floor; falls through to distance.
        let score = similarity("cha", "charizard");
        assert!(score < STRONG_MATCH);
    }

    #[test]
    fn single_edit_scores_high() {
        let score = similarity("pikachu", "pikachu2");
        assert!(score > 0.85 && score < 1.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(similarity("pikachu", "blastoise") < SUGGEST_MATCH);
    }
}
