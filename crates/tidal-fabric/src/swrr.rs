//! Smooth weighted round robin over the two paths of a route.
//!
//! Produces weight-proportional long-run selection with minimal
//! burstiness: each pick adds every path's effective weight to its
//! accumulator, takes the largest, and charges the winner the total.
//! Accumulators start at zero and are reset whenever a new weight
//! document is applied, so new flows see the new distribution
//! immediately.

/// Per-route SWRR state for the two spine choices.
#[derive(Debug, Clone)]
pub struct SmoothWrr {
    spines: [String; 2],
    effective: [i64; 2],
    current: [i64; 2],
}

impl SmoothWrr {
    /// Build from `(spine, selection_ratio)` pairs. Effective weights
    /// are the ratios scaled to integers out of 100.
    pub fn new(paths: [(String, f64); 2]) -> Self {
        let [(s0, r0), (s1, r1)] = paths;
        Self {
            spines: [s0, s1],
            effective: [(100.0 * r0).round() as i64, (100.0 * r1).round() as i64],
            current: [0, 0],
        }
    }

    /// Pick the spine for a new flow.
    pub fn select(&mut self) -> &str {
        let total = self.effective[0] + self.effective[1];
        self.current[0] += self.effective[0];
        self.current[1] += self.effective[1];
        let winner = if self.current[0] >= self.current[1] { 0 } else { 1 };
        self.current[winner] -= total;
        &self.spines[winner]
    }

    /// Zero the accumulators (applied on weight-document reload).
    pub fn reset(&mut self) {
        self.current = [0, 0];
    }

    pub fn effective_weights(&self) -> [i64; 2] {
        self.effective
    }

    pub fn spines(&self) -> [&str; 2] {
        [&self.spines[0], &self.spines[1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrr(r0: f64, r1: f64) -> SmoothWrr {
        SmoothWrr::new([("spine0".to_string(), r0), ("spine1".to_string(), r1)])
    }

    fn count(wrr: &mut SmoothWrr, n: usize) -> (usize, usize) {
        let mut a = 0;
        let mut b = 0;
        for _ in 0..n {
            match wrr.select() {
                "spine0" => a += 1,
                _ => b += 1,
            }
        }
        (a, b)
    }

    #[test]
    fn frequencies_match_ratios() {
        let mut w = wrr(0.2, 0.8);
        let (a, b) = count(&mut w, 100);
        assert_eq!(a, 20);
        assert_eq!(b, 80);
    }

    #[test]
    fn even_split_alternates() {
        let mut w = wrr(0.5, 0.5);
        let (a, b) = count(&mut w, 100);
        assert_eq!(a, 50);
        assert_eq!(b, 50);
        // Smoothness: no run longer than 1 for equal weights.
        let mut last = w.select().to_string();
        for _ in 0..10 {
            let next = w.select().to_string();
            assert_ne!(next, last);
            last = next;
        }
    }

    #[test]
    fn skewed_weights_spread_rather_than_burst() {
        // With (0.25, 0.75) the minority path must never be picked
        // twice in a row.
        let mut w = wrr(0.25, 0.75);
        let mut prev_minority = false;
        for _ in 0..200 {
            let minority = w.select() == "spine0";
            assert!(!(minority && prev_minority), "minority path picked back-to-back");
            prev_minority = minority;
        }
    }

    #[test]
    fn degenerate_zero_weight_never_selected() {
        let mut w = wrr(0.0, 1.0);
        let (a, b) = count(&mut w, 50);
        assert_eq!(a, 0);
        assert_eq!(b, 50);
    }

    #[test]
    fn reset_restores_initial_sequence() {
        let mut w = wrr(0.3, 0.7);
        let first: Vec<String> = (0..10).map(|_| w.select().to_string()).collect();
        w.reset();
        let second: Vec<String> = (0..10).map(|_| w.select().to_string()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn effective_weights_round_ratios() {
        let w = wrr(0.204, 0.796);
        assert_eq!(w.effective_weights(), [20, 80]);
    }
}
