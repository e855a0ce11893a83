//! Weighted fairness accounting for the supplier.
//!
//! Each registration tracks how many items it has supplied in the current
//! fairness window. Its *batch* is `supplied / weight`, and its *gap* is how
//! far that batch trails the highest batch seen in the window, scaled back
//! up by the weight. The supplier always serves the occupied slot with the
//! largest gap; ties go to the slot scanned last.
//!
//! Once every registration has caught up with the highest batch the window
//! restarts: supplied and produced counters and the maximum go back to
//! zero. Over a long
//! run each registration is served in proportion to its weight.

/// Tolerance when comparing batches, so 0.1 + 0.2 style rounding still
/// counts as caught up
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub weight: f64,
    /// Items supplied in the current fairness window
    pub supplied: u64,
    /// `supplied / weight`
    pub batch: f64,
    /// Items produced into the supplier buffer in the current window
    pub produced: u64,
    pub total_supplied: u64,
    pub total_produced: u64,
}

impl LedgerEntry {
    fn new(weight: f64) -> Self {
        Self {
            weight,
            supplied: 0,
            batch: 0.0,
            produced: 0,
            total_supplied: 0,
            total_produced: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FairnessLedger {
    entries: Vec<LedgerEntry>,
    max_batch: f64,
    resets: u64,
}

impl FairnessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration; returns its index. `weight` must be positive.
    pub fn add(&mut self, weight: f64) -> usize {
        self.entries.push(LedgerEntry::new(weight));
        self.entries.len() - 1
    }

    pub fn set_weight(&mut self, index: usize, weight: f64) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.weight = weight;
            entry.batch = entry.supplied as f64 / weight;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&LedgerEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn total_weight(&self) -> f64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    pub fn max_batch(&self) -> f64 {
        self.max_batch
    }

    /// Number of times the fairness window restarted
    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn gap(&self, index: usize) -> f64 {
        self.entries
            .get(index)
            .map(|e| (self.max_batch - e.batch) * e.weight)
            .unwrap_or(f64::MIN)
    }

    /// Choose among `(slot, registration)` candidates in scan order.
    ///
    /// Returns the slot whose registration has the largest gap, preferring
    /// the later candidate on ties.
    pub fn pick<I>(&self, candidates: I) -> Option<usize>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let mut best: Option<(usize, f64)> = None;
        for (slot, index) in candidates {
            let gap = self.gap(index);
            match best {
                Some((_, best_gap)) if gap < best_gap => {}
                _ => best = Some((slot, gap)),
            }
        }
        best.map(|(slot, _)| slot)
    }

    /// Record one item handed to a consumer from registration `index`
    pub fn count_supply(&mut self, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        entry.supplied += 1;
        entry.total_supplied += 1;

        for entry in &mut self.entries {
            entry.batch = entry.supplied as f64 / entry.weight;
            if entry.batch > self.max_batch {
                self.max_batch = entry.batch;
            }
        }

        let caught_up = self
            .entries
            .iter()
            .all(|e| e.batch + EPSILON >= self.max_batch);
        if caught_up {
            for entry in &mut self.entries {
                entry.supplied = 0;
                entry.produced = 0;
                entry.batch = 0.0;
            }
            self.max_batch = 0.0;
            self.resets += 1;
            log::trace!("Fairness window reset ({} so far)", self.resets);
        }
    }

    /// Record one item produced into the supplier buffer; diagnostics only
    pub fn count_produced(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.produced += 1;
            entry.total_produced += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serve `rounds` requests with every registration always occupied
    fn serve(ledger: &mut FairnessLedger, rounds: usize) -> Vec<u64> {
        let mut served = vec![0; ledger.len()];
        for _ in 0..rounds {
            let slot = ledger
                .pick((0..ledger.len()).map(|i| (i, i)))
                .unwrap();
            ledger.count_supply(slot);
            served[slot] += 1;
        }
        served
    }

    #[test]
    fn test_weighted_ratio() {
        let mut ledger = FairnessLedger::new();
        ledger.add(1.0);
        ledger.add(2.0);
        assert_eq!(serve(&mut ledger, 3000), vec![1000, 2000]);
    }

    #[test]
    fn test_equal_weights_round_robin() {
        let mut ledger = FairnessLedger::new();
        for _ in 0..3 {
            ledger.add(1.0);
        }
        assert_eq!(serve(&mut ledger, 300), vec![100, 100, 100]);
    }

    #[test]
    fn test_fractional_weights() {
        let mut ledger = FairnessLedger::new();
        ledger.add(0.5);
        ledger.add(1.5);
        assert_eq!(serve(&mut ledger, 400), vec![100, 300]);
    }

    #[test]
    fn test_tie_goes_to_later_candidate() {
        let mut ledger = FairnessLedger::new();
        ledger.add(1.0);
        ledger.add(1.0);
        assert_eq!(ledger.pick([(0, 0), (1, 1)]), Some(1));
        assert_eq!(ledger.pick([(1, 1), (0, 0)]), Some(0));
        assert_eq!(ledger.pick(std::iter::empty()), None);
    }

    #[test]
    fn test_window_resets_when_everyone_catches_up() {
        let mut ledger = FairnessLedger::new();
        ledger.add(1.0);
        ledger.add(2.0);
        ledger.count_produced(0);
        ledger.count_produced(1);
        ledger.count_produced(1);

        ledger.count_supply(1);
        assert_eq!(ledger.max_batch(), 0.5);
        ledger.count_supply(0);
        assert_eq!(ledger.max_batch(), 1.0);
        assert_eq!(ledger.resets(), 0);

        ledger.count_supply(1);
        assert_eq!(ledger.resets(), 1);
        assert_eq!(ledger.max_batch(), 0.0);
        assert!(ledger.entries().iter().all(|e| e.supplied == 0));
        assert!(ledger.entries().iter().all(|e| e.produced == 0));
        assert_eq!(ledger.entry(0).unwrap().total_supplied, 1);
        assert_eq!(ledger.entry(1).unwrap().total_supplied, 2);
        assert_eq!(ledger.entry(1).unwrap().total_produced, 2);

        ledger.count_produced(0);
        assert_eq!(ledger.entry(0).unwrap().produced, 1);
        assert_eq!(ledger.entry(0).unwrap().total_produced, 2);
    }

    #[test]
    fn test_starved_registration_catches_up() {
        let mut ledger = FairnessLedger::new();
        ledger.add(1.0);
        ledger.add(2.0);

        // Only the first registration has content for a while
        for _ in 0..10 {
            assert_eq!(ledger.pick([(0, 0)]), Some(0));
            ledger.count_supply(0);
        }

        // The second one is then served until its batch matches
        let mut streak = 0;
        while ledger.pick([(0, 0), (1, 1)]) == Some(1) {
            ledger.count_supply(1);
            streak += 1;
            if ledger.resets() > 0 {
                break;
            }
        }
        assert_eq!(streak, 20);
        assert_eq!(ledger.resets(), 1);
    }

    #[test]
    fn test_set_weight_rescales_batch() {
        let mut ledger = FairnessLedger::new();
        ledger.add(1.0);
        ledger.add(1.0);
        ledger.count_supply(0);
        assert_eq!(ledger.entry(0).unwrap().batch, 1.0);

        ledger.set_weight(0, 4.0);
        assert_eq!(ledger.entry(0).unwrap().batch, 0.25);
        assert_eq!(ledger.total_weight(), 5.0);
    }

    #[test]
    fn test_count_produced_is_independent() {
        let mut ledger = FairnessLedger::new();
        ledger.add(1.0);
        ledger.count_produced(0);
        ledger.count_produced(0);
        ledger.count_produced(7);

        let entry = ledger.entry(0).unwrap();
        assert_eq!(entry.produced, 2);
        assert_eq!(entry.total_produced, 2);
        assert_eq!(entry.supplied, 0);
    }
}
