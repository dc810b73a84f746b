//! Weighted random backend selection.
//!
//! Weights are relative probability mass. A cumulative-weight draw picks
//! one entry; when every remaining weight is zero the draw is uniform.
//! [`WeightedDraw`] repeats the draw without replacement so a backend is
//! tried at most once per request.

use rand::Rng;

use crate::policy::model::BackendWeight;

/// Index of one entry drawn by weight, or `None` when `candidates` is empty.
pub fn pick_weighted<R: Rng + ?Sized>(candidates: &[BackendWeight], rng: &mut R) -> Option<usize> {
    match candidates.len() {
        0 => return None,
        1 => return Some(0),
        _ => {}
    }

    let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        return Some(rng.gen_range(0..candidates.len()));
    }

    let mut point = rng.gen_range(0..total);
    for (idx, candidate) in candidates.iter().enumerate() {
        let weight = u64::from(candidate.weight);
        if point < weight {
            return Some(idx);
        }
        point -= weight;
    }
    Some(candidates.len() - 1)
}

/// Successive weighted draws without replacement.
#[derive(Debug, Clone)]
pub struct WeightedDraw {
    remaining: Vec<BackendWeight>,
}

impl WeightedDraw {
    #[must_use]
    pub fn new(candidates: Vec<BackendWeight>) -> Self {
        Self {
            remaining: candidates,
        }
    }

    pub fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<BackendWeight> {
        let idx = pick_weighted(&self.remaining, rng)?;
        Some(self.remaining.remove(idx))
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}
