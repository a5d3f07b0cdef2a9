//! Dynamic Weighted Random Selection.
//!
//! Maps each candidate backend's live CPU/memory load to an integer
//! weight and draws a backend at random in proportion to the weights.
//! Lightly loaded backends are proportionally more likely to receive
//! the NAT target. The core is pure: given the same candidates and
//! the same draw, it always returns the same backend.

use rand::Rng;

use tidal_common::models::LiveSample;

/// A schedulable backend paired with its live telemetry.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: String,
    pub sample: LiveSample,
}

/// Combined load percentage: CPU dominates slightly over memory.
pub fn comprehensive_load(sample: &LiveSample) -> f64 {
    0.55 * sample.cpu_pct + 0.45 * sample.memory_pct
}

/// Selection weight. Fully loaded (or overloaded) backends keep a
/// floor weight of 1 so they remain reachable when nothing better
/// exists.
pub fn weight(sample: &LiveSample) -> u64 {
    let load = comprehensive_load(sample);
    if load >= 100.0 {
        1
    } else {
        (100 - load.floor() as i64).max(1) as u64
    }
}

/// Sum of candidate weights; the draw space for `select`.
pub fn total_weight(candidates: &[Candidate]) -> u64 {
    candidates.iter().map(|c| weight(&c.sample)).sum()
}

/// Deterministic core: walk candidates in their given (stable) order
/// accumulating weights and return the first whose running sum
/// reaches `x`. `x` must lie in `1..=total_weight`.
pub fn select(candidates: &[Candidate], x: u64) -> Option<&Candidate> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(&candidates[0]);
    }
    let mut acc = 0u64;
    for candidate in candidates {
        acc += weight(&candidate.sample);
        if acc >= x {
            return Some(candidate);
        }
    }
    // x beyond the weight sum; caller drew outside 1..=W.
    candidates.last()
}

/// Draw a backend at random, weight-proportionally.
pub fn pick<'a, R: Rng>(candidates: &'a [Candidate], rng: &mut R) -> Option<&'a Candidate> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(&candidates[0]);
    }
    let total = total_weight(candidates);
    let x = rng.random_range(1..=total);
    select(candidates, x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(address: &str, cpu: f64, mem: f64) -> Candidate {
        Candidate {
            address: address.to_string(),
            sample: LiveSample {
                cpu_pct: cpu,
                memory_pct: mem,
                rps: 0.0,
                total_memory_bytes: 0,
                total_cpu_cores: 0,
                fresh: true,
            },
        }
    }

    #[test]
    fn load_blends_cpu_and_memory() {
        let c = candidate("a", 80.0, 40.0);
        assert!((comprehensive_load(&c.sample) - 62.0).abs() < 1e-9);
    }

    #[test]
    fn weight_floors_at_one_when_saturated() {
        assert_eq!(weight(&candidate("a", 100.0, 100.0).sample), 1);
        assert_eq!(weight(&candidate("a", 200.0, 0.0).sample), 1);
        // exactly at the boundary
        assert_eq!(weight(&candidate("a", 100.0, 100.0).sample), 1);
    }

    #[test]
    fn weight_inverts_load() {
        // load = 62.0 → weight = 100 - 62 = 38
        assert_eq!(weight(&candidate("a", 80.0, 40.0).sample), 38);
        // idle backend gets full weight
        assert_eq!(weight(&candidate("a", 0.0, 0.0).sample), 100);
    }

    #[test]
    fn empty_set_selects_nothing() {
        assert!(select(&[], 1).is_none());
    }

    #[test]
    fn single_candidate_is_unconditional() {
        // Even a saturated lone backend is selected.
        let cands = vec![candidate("a", 100.0, 100.0)];
        assert_eq!(select(&cands, 1).unwrap().address, "a");
    }

    #[test]
    fn draw_space_partitions_by_weight() {
        // Exhaustively walk the draw space: each candidate must be hit
        // exactly weight(c) times, which is the probability contract.
        let cands = vec![
            candidate("a", 20.0, 20.0), // load 20 → weight 80
            candidate("b", 80.0, 80.0), // load 80 → weight 20
        ];
        let total = total_weight(&cands);
        assert_eq!(total, 100);

        let mut hits = std::collections::HashMap::new();
        for x in 1..=total {
            let chosen = select(&cands, x).unwrap();
            *hits.entry(chosen.address.clone()).or_insert(0u64) += 1;
        }
        assert_eq!(hits["a"], 80);
        assert_eq!(hits["b"], 20);
    }

    #[test]
    fn selection_is_stable_for_fixed_draw() {
        let cands = vec![
            candidate("a", 50.0, 50.0),
            candidate("b", 50.0, 50.0),
            candidate("c", 50.0, 50.0),
        ];
        let first = select(&cands, 75).unwrap().address.clone();
        for _ in 0..10 {
            assert_eq!(select(&cands, 75).unwrap().address, first);
        }
    }

    #[test]
    fn pick_returns_member_of_candidate_set() {
        let cands = vec![
            candidate("a", 10.0, 10.0),
            candidate("b", 90.0, 90.0),
            candidate("c", 55.0, 45.0),
        ];
        let mut rng = rand::rng();
        for _ in 0..100 {
            let chosen = pick(&cands, &mut rng).unwrap();
            assert!(cands.iter().any(|c| c.address == chosen.address));
        }
    }
}
