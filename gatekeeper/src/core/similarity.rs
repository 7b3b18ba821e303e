//! Token-level similarity used by the intent layer and example matching.

use std::collections::BTreeSet;

/// Lowercased alphanumeric tokens.
pub fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whitespace-collapsed lowercase form used for dedupe keys.
pub fn normalize(text: &str) -> String {
    tokens(text).join(" ")
}

/// Jaccard similarity of token sets. Two empty texts are identical.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let left: BTreeSet<String> = tokens(a).into_iter().collect();
    let right: BTreeSet<String> = tokens(b).into_iter().collect();
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_scores_one() {
        assert!((jaccard("show memory usage", "Show  memory usage!") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn partial_overlap_scores_fraction() {
        // {check, logs} vs {check, disk}: 1 shared of 3.
        assert!((jaccard("check logs", "check disk") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard("alpha", "beta"), 0.0);
        assert_eq!(jaccard("", ""), 1.0);
    }

    #[test]
    fn normalize_collapses_punctuation() {
        assert_eq!(normalize("  Restart, the  SERVICE "), "restart the service");
    }
}
