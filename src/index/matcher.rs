//! Approximate tool-name matching
//!
//! Kept behind [`NameMatcher`] so the scoring heuristic can be swapped and
//! tested without touching exact lookup.

/// Scoring function used for approximate name resolution
pub trait NameMatcher: Send + Sync {
    /// Canonical form used for the O(1) variant table
    fn normalize(&self, name: &str) -> String;

    /// Similarity in `(0, 1]`, or `None` if `query` is not a plausible match
    fn score(&self, query: &str, candidate: &str) -> Option<f64>;
}

/// Default matcher: separator/case normalization, then bounded edit distance
#[derive(Debug, Clone)]
pub struct NormalizedMatcher {
    /// Hard ceiling on edits regardless of name length
    pub max_distance: usize,
}

impl Default for NormalizedMatcher {
    fn default() -> Self {
        Self { max_distance: 2 }
    }
}

impl NormalizedMatcher {
    /// Edits allowed for names of this length (one per four characters)
    fn allowed_distance(&self, len: usize) -> usize {
        (len / 4).min(self.max_distance)
    }
}

impl NameMatcher for NormalizedMatcher {
    fn normalize(&self, name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut last_sep = true;
        for c in name.trim().chars() {
            if c.is_alphanumeric() {
                out.extend(c.to_lowercase());
                last_sep = false;
            } else if !last_sep {
                out.push('_');
                last_sep = true;
            }
        }
        while out.ends_with('_') {
            out.pop();
        }
        out
    }

    fn score(&self, query: &str, candidate: &str) -> Option<f64> {
        let q = self.normalize(query);
        let c = self.normalize(candidate);
        if q.is_empty() || c.is_empty() {
            return None;
        }

        let longest = q.chars().count().max(c.chars().count());
        let distance = levenshtein(&q, &c);
        if distance > self.allowed_distance(longest) {
            return None;
        }
        Some(1.0 - distance as f64 / longest as f64)
    }
}

/// Strip a server qualifier such as `github__search` or `fs/read`
pub fn unqualified(name: &str) -> &str {
    let after_double = name.rsplit("__").next().unwrap_or(name);
    after_double
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(after_double)
}

/// Compact variant with all separators removed
pub fn compact(normalized: &str) -> String {
    normalized.chars().filter(|c| *c != '_').collect()
}

/// Classic two-row edit distance over chars
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
