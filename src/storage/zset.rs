//! Sorted Set
//!
//! A score-ordered index over string members. Two structures are kept in
//! lockstep: a member→score map for O(1) score lookup, and a vector of
//! `(score, member)` pairs sorted ascending with ties broken by member, for
//! rank and range queries. Every member appears at most once in each.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ZSet {
    scores: HashMap<String, f64>,
    ordered: Vec<(f64, String)>,
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a member.
    ///
    /// Returns `true` if the member was new, `false` if its score was
    /// updated (the old ordering entry is removed first, so the member
    /// never appears twice).
    pub fn add(&mut self, score: f64, member: &str) -> bool {
        let is_new = match self.scores.insert(member.to_string(), score) {
            Some(old_score) => {
                if let Ok(idx) = self.position(old_score, member) {
                    self.ordered.remove(idx);
                }
                false
            }
            None => true,
        };

        let idx = self.position(score, member).unwrap_or_else(|i| i);
        self.ordered.insert(idx, (score, member.to_string()));
        is_new
    }

    /// The member's zero-based rank in ascending score order.
    pub fn rank(&self, member: &str) -> Option<usize> {
        let score = *self.scores.get(member)?;
        self.position(score, member).ok()
    }

    /// The member's score.
    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Members in the inclusive index range `[start, stop]`, clamped like
    /// list ranges; negative indices count from the end.
    pub fn range(&self, start: i64, stop: i64) -> Vec<String> {
        let Some((lo, hi)) = super::slice_bounds(self.ordered.len(), start, stop) else {
            return Vec::new();
        };
        self.ordered[lo..=hi]
            .iter()
            .map(|(_, member)| member.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Binary search for the `(score, member)` pair's position in the
    /// ordered vector. Scores are never NaN (rejected at the command layer),
    /// so the partial comparison is total here.
    fn position(&self, score: f64, member: &str) -> Result<usize, usize> {
        self.ordered.binary_search_by(|(s, m)| {
            s.partial_cmp(&score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| m.as_str().cmp(member))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_orders_by_score() {
        let mut zset = ZSet::new();
        zset.add(1000.0, "alice");
        zset.add(3000.0, "bob");
        zset.add(2000.0, "charlie");

        assert_eq!(zset.range(0, 1), vec!["alice", "charlie"]);
        assert_eq!(zset.range(0, -1), vec!["alice", "charlie", "bob"]);
    }

    #[test]
    fn test_rank() {
        let mut zset = ZSet::new();
        zset.add(1000.0, "alice");
        zset.add(3000.0, "bob");
        zset.add(2000.0, "charlie");

        assert_eq!(zset.rank("alice"), Some(0));
        assert_eq!(zset.rank("charlie"), Some(1));
        assert_eq!(zset.rank("bob"), Some(2));
        assert_eq!(zset.rank("missing"), None);
    }

    #[test]
    fn test_score() {
        let mut zset = ZSet::new();
        zset.add(2.5, "m");
        assert_eq!(zset.score("m"), Some(2.5));
        assert_eq!(zset.score("absent"), None);
    }

    #[test]
    fn test_equal_scores_tie_break_by_member() {
        let mut zset = ZSet::new();
        zset.add(1.0, "b");
        zset.add(1.0, "a");
        zset.add(1.0, "c");

        assert_eq!(zset.range(0, -1), vec!["a", "b", "c"]);
        assert_eq!(zset.rank("b"), Some(1));
    }

    #[test]
    fn test_readd_updates_score_without_duplicating() {
        let mut zset = ZSet::new();
        assert!(zset.add(1.0, "m"));
        assert!(!zset.add(5.0, "m"));

        assert_eq!(zset.len(), 1);
        assert_eq!(zset.score("m"), Some(5.0));
    }

    #[test]
    fn test_readd_moves_rank() {
        let mut zset = ZSet::new();
        zset.add(1.0, "a");
        zset.add(2.0, "b");
        zset.add(3.0, "a");

        assert_eq!(zset.range(0, -1), vec!["b", "a"]);
    }

    #[test]
    fn test_range_clamps_out_of_bounds() {
        let mut zset = ZSet::new();
        zset.add(1.0, "a");
        zset.add(2.0, "b");

        assert_eq!(zset.range(0, 100), vec!["a", "b"]);
        assert_eq!(zset.range(5, 10), Vec::<String>::new());
        assert_eq!(zset.range(-100, 0), vec!["a"]);
    }
}
