//! Bounded top-K selection over a score vector.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

/// A `(row, score)` pair ordered by score, then by row so that equal
/// scores keep a stable order.
#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    row: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower row wins ties, so it must compare as "greater".
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.row.cmp(&self.row))
    }
}

/// Select the `limit` best rows whose score is strictly above `threshold`.
///
/// Keeps a min-heap of at most `limit` entries: a new score only replaces
/// the current minimum when it is strictly greater, so the work is
/// `O(n log limit)`. NaN scores are skipped. The result is sorted by
/// descending score.
///
/// # Examples
///
/// ```
/// use ragweave::topk::select_top_k;
///
/// let scores = [0.1, 0.9, 0.5, 0.7, 0.2];
/// assert_eq!(select_top_k(&scores, 2, 0.3), vec![(1, 0.9), (3, 0.7)]);
/// ```
pub fn select_top_k(
    scores: &[f32],
    limit: usize,
    threshold: f32,
) -> Vec<(usize, f32)> {
    select_top_k_by(scores.iter().copied().enumerate(), limit, |s| {
        s > threshold
    })
}

/// Like [`select_top_k`] but over arbitrary `(row, score)` pairs with a
/// caller-supplied admission test.
pub fn select_top_k_by<I, F>(
    scored: I,
    limit: usize,
    admit: F,
) -> Vec<(usize, f32)>
where
    I: IntoIterator<Item = (usize, f32)>,
    F: Fn(f32) -> bool,
{
    if limit == 0 {
        return Vec::new();
    }

    let mut heap: BinaryHeap<Reverse<Scored>> =
        BinaryHeap::with_capacity(limit + 1);

    for (row, score) in scored {
        if score.is_nan() || !admit(score) {
            continue;
        }
        let candidate = Scored { score, row };
        if heap.len() < limit {
            heap.push(Reverse(candidate));
            continue;
        }
        if let Some(Reverse(min)) = heap.peek()
            && candidate.score > min.score
        {
            heap.pop();
            heap.push(Reverse(candidate));
        }
    }

    let mut result: Vec<Scored> =
        heap.into_iter().map(|Reverse(s)| s).collect();
    result.sort_unstable_by(|a, b| b.cmp(a));
    result.into_iter().map(|s| (s.row, s.score)).collect()
}
