//! Branch statistics and the store they persist to.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::dispatch::ComponentFailure;

/// Success and failure counts for one branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchStats {
    pub successes: u64,
    pub failures: u64,
}

impl BranchStats {
    /// Observed success rate. Branches without feedback are worth 0.
    pub fn value(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    pub fn observations(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Per-branch statistics of one router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterState {
    branches: Vec<BranchStats>,
}

impl RouterState {
    pub fn new(n_branches: usize) -> Self {
        Self {
            branches: vec![BranchStats::default(); n_branches],
        }
    }

    /// Parses the persisted `[s0, f0, s1, f1, ...]` form.
    pub fn from_flat(values: &[u64], n_branches: usize) -> Result<Self, ComponentFailure> {
        if values.len() != n_branches * 2 {
            return Err(ComponentFailure::new(format!(
                "stored router state has {} values, expected {}",
                values.len(),
                n_branches * 2
            )));
        }
        let branches = values
            .chunks_exact(2)
            .map(|pair| BranchStats {
                successes: pair[0],
                failures: pair[1],
            })
            .collect();
        Ok(Self { branches })
    }

    pub fn to_flat(&self) -> Vec<u64> {
        self.branches
            .iter()
            .flat_map(|b| [b.successes, b.failures])
            .collect()
    }

    pub fn branches(&self) -> &[BranchStats] {
        &self.branches
    }

    pub fn n_branches(&self) -> usize {
        self.branches.len()
    }

    /// Adds `successes` and `failures` to `branch`.
    pub fn record(&mut self, branch: usize, successes: u64, failures: u64) -> Result<(), ComponentFailure> {
        let n = self.branches.len();
        let stats = self
            .branches
            .get_mut(branch)
            .ok_or_else(|| ComponentFailure::new(format!("branch {branch} out of range for {n} branches")))?;
        stats.successes += successes;
        stats.failures += failures;
        Ok(())
    }

    /// Branch with the highest value among those with feedback, or
    /// `fallback` before any feedback arrived. Ties keep the lowest index.
    pub fn best_branch(&self, fallback: usize) -> usize {
        let mut best: Option<(usize, f64)> = None;
        for (i, stats) in self.branches.iter().enumerate() {
            if stats.observations() == 0 {
                continue;
            }
            let value = stats.value();
            if best.is_none_or(|(_, v)| value > v) {
                best = Some((i, value));
            }
        }
        best.map_or(fallback, |(i, _)| i)
    }
}

/// Key under which a router's statistics are stored.
pub fn state_key(deployment: &str, predictor: &str, unit: &str) -> String {
    format!("{deployment}_{predictor}_{unit}-beta-params")
}

/// Flat integer lists keyed by string.
///
/// Routers read with `get` and write with one `compare_and_swap`. The
/// pair is not a transaction: when the swap loses to a concurrent
/// writer the caller sees `false` and that update is not applied.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u64>>, ComponentFailure>;

    /// Writes `new` if the current value equals `expected`. Returns
    /// whether the write happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u64]>,
        new: Vec<u64>,
    ) -> Result<bool, ComponentFailure>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    values: Mutex<HashMap<String, Vec<u64>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u64>>, ComponentFailure> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u64]>,
        new: Vec<u64>,
    ) -> Result<bool, ComponentFailure> {
        let mut values = self.values.lock();
        if values.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        values.insert(key.to_string(), new);
        Ok(true)
    }
}
