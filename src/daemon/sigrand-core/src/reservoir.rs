//! Reservoir sampling with a reservoir of one (Algorithm R)

use rand::Rng;

/// Single-slot reservoir.
///
/// Holds only a running count and the current candidate, so memory use does
/// not depend on how many items are offered. After `n` offers every item has
/// been kept with probability exactly `1/n`.
#[derive(Debug)]
pub struct Reservoir<T> {
    seen: u64,
    winner: Option<T>,
}

impl<T> Reservoir<T> {
    pub fn new() -> Self {
        Self {
            seen: 0,
            winner: None,
        }
    }

    /// Offer the next item. Returns `true` if it became the candidate.
    pub fn offer<R: Rng + ?Sized>(&mut self, item: T, rng: &mut R) -> bool {
        self.seen += 1;
        if rng.gen_range(0..self.seen) == 0 {
            self.winner = Some(item);
            true
        } else {
            false
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn into_winner(self) -> Option<T> {
        self.winner
    }
}

impl<T> Default for Reservoir<T> {
    fn default() -> Self {
        Self::new()
    }
}
