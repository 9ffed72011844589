use strsim::normalized_damerau_levenshtein;

/// Fuzzy matcher for schema identifiers (table and column names)
#[derive(Debug, Clone)]
pub struct FuzzyMatcher {
    /// Similarity threshold (0.0-1.0) below which candidates are dropped
    pub similarity_threshold: f64,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
        }
    }
}

/// A candidate that scored at or above the threshold
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch {
    pub candidate: String,
    pub score: f64,
}

impl FuzzyMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            similarity_threshold: threshold,
        }
    }

    /// Calculate similarity between two identifiers.
    /// Returns a score between 0.0 and 1.0 (higher = more similar)
    ///
    /// Case-insensitive normalized Damerau-Levenshtein, so a single
    /// transposition ("prodcuts") costs one edit. Symmetric in its arguments.
    pub fn similarity(a: &str, b: &str) -> f64 {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        normalized_damerau_levenshtein(&a, &b).clamp(0.0, 1.0)
    }

    /// Check if two identifiers are similar enough to be considered a match
    pub fn is_match(&self, a: &str, b: &str) -> bool {
        Self::similarity(a, b) >= self.similarity_threshold
    }

    /// Candidates scoring at least `threshold`, best first, at most `max_results`.
    /// Equal scores keep the order in which candidates were supplied.
    pub fn find_closest<S: AsRef<str>>(
        target: &str,
        candidates: &[S],
        threshold: f64,
        max_results: usize,
    ) -> Vec<FuzzyMatch> {
        if target.is_empty() || candidates.is_empty() || max_results == 0 {
            return Vec::new();
        }

        let mut matches: Vec<FuzzyMatch> = candidates
            .iter()
            .map(|candidate| FuzzyMatch {
                candidate: candidate.as_ref().to_string(),
                score: Self::similarity(target, candidate.as_ref()),
            })
            .filter(|m| m.score >= threshold)
            .collect();

        // sort_by is stable, which gives the tie-break on input order
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(max_results);
        matches
    }

    /// Single best candidate at or above `threshold`
    pub fn find_best_match<S: AsRef<str>>(
        target: &str,
        candidates: &[S],
        threshold: f64,
    ) -> Option<FuzzyMatch> {
        Self::find_closest(target, candidates, threshold, 1).into_iter().next()
    }

    /// `find_closest` using this matcher's own threshold
    pub fn closest<S: AsRef<str>>(&self, target: &str, candidates: &[S], max_results: usize) -> Vec<FuzzyMatch> {
        Self::find_closest(target, candidates, self.similarity_threshold, max_results)
    }
}
