//! Probe sequence constants
//!
//! Every page carries its own ordering of [`PROBE_STEPS`]. The low four bits
//! of a hash pick the step, so shuffling per page keeps probe chains from
//! lining up with bit patterns shared across many hashes. Local directory
//! sizes are always prime, which makes every step coprime with the directory
//! and guarantees a probe walk visits each slot exactly once.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Step constants shuffled into each new page
pub const PROBE_STEPS: [u16; 16] = [1, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

/// Random source for probe shuffling, seeded when reproducible layouts are needed
pub fn probe_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// A fresh per-page ordering of the probe steps
pub fn shuffled_steps<R: Rng + ?Sized>(rng: &mut R) -> [u16; 16] {
    let mut steps = PROBE_STEPS;
    steps.shuffle(rng);
    steps
}

pub fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u32;
    while d.saturating_mul(d) <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Smallest prime `>= n`
pub fn next_prime(n: u32) -> u32 {
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

/// Largest prime `<= n`, if any
pub fn prev_prime(n: u32) -> Option<u32> {
    (2..=n).rev().find(|&candidate| is_prime(candidate))
}
