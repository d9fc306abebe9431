//! Epsilon-greedy multi-armed bandit router.
//!
//! Routes to the branch with the best observed success rate, exploring a
//! uniformly random branch with probability `epsilon`. Feedback rewards
//! are turned into success/failure counts for the branch that served the
//! request and written back to a [`StateStore`].

pub mod store;

pub use store::{BranchStats, InMemoryStateStore, RouterState, StateStore, state_key};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::artifacts::ArtifactSource;
use crate::array::CanonicalArray;
use crate::config::BanditConfig;
use crate::dispatch::{
    Component, ComponentFailure, ComponentResult, FeedbackHandler, FeedbackRequest, Loader,
    MetricsSource, Router, TagsSource,
};
use crate::metrics::MetricRecord;

/// Successes and failures credited for a batch of `rows` with `reward`.
///
/// Successes are `floor(reward * rows)` clamped to `[0, rows]`, so the two
/// always sum to `rows`.
pub fn split_reward(reward: f64, rows: usize) -> (u64, u64) {
    let rows = rows as u64;
    let scaled = (reward * rows as f64).floor();
    let successes = if scaled.is_finite() {
        (scaled.max(0.0) as u64).min(rows)
    } else {
        0
    };
    (successes, rows - successes)
}

pub struct EpsilonGreedy {
    name: String,
    n_branches: usize,
    epsilon: f64,
    fallback_branch: usize,
    key: String,
    store: Arc<dyn StateStore>,
    rng: Mutex<StdRng>,
    seed_uri: Option<String>,
    artifacts: Arc<dyn ArtifactSource>,
}

impl EpsilonGreedy {
    pub fn new(
        name: impl Into<String>,
        config: &BanditConfig,
        key: String,
        store: Arc<dyn StateStore>,
        artifacts: Arc<dyn ArtifactSource>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            name: name.into(),
            n_branches: config.n_branches,
            epsilon: config.epsilon,
            fallback_branch: config.best_branch,
            key,
            store,
            rng: Mutex::new(rng),
            seed_uri: None,
            artifacts,
        }
    }

    /// Seeds the store from a JSON list `[s0, f0, s1, f1, ...]` at load
    /// time when no state exists yet.
    pub fn with_seed_state(mut self, uri: impl Into<String>) -> Self {
        self.seed_uri = Some(uri.into());
        self
    }

    pub fn state_key(&self) -> &str {
        &self.key
    }

    /// Current statistics. Missing state reads as all zeros.
    pub fn state(&self) -> ComponentResult<RouterState> {
        match self.store.get(&self.key)? {
            Some(flat) => RouterState::from_flat(&flat, self.n_branches),
            None => Ok(RouterState::new(self.n_branches)),
        }
    }

    fn read_seed(&self, uri: &str) -> ComponentResult<Vec<u64>> {
        let path = self.artifacts.download(uri)?;
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ComponentFailure::new(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ComponentFailure::new(format!("invalid router state in {}: {e}", path.display())))
    }
}

impl Loader for EpsilonGreedy {
    fn load(&self) -> ComponentResult<()> {
        let Some(uri) = &self.seed_uri else {
            return Ok(());
        };
        let flat = self.read_seed(uri)?;
        RouterState::from_flat(&flat, self.n_branches)?;
        if self.store.compare_and_swap(&self.key, None, flat)? {
            info!(key = %self.key, uri = %uri, "Seeded router state");
        } else {
            debug!(key = %self.key, "Router state already present, seed ignored");
        }
        Ok(())
    }
}

impl Router for EpsilonGreedy {
    fn route(&self, _features: &CanonicalArray, _names: &[String]) -> ComponentResult<i64> {
        let state = self.state()?;
        let mut rng = self.rng.lock();
        let branch = if rng.random::<f64>() < self.epsilon {
            rng.random_range(0..self.n_branches)
        } else {
            state.best_branch(self.fallback_branch)
        };
        Ok(branch as i64)
    }
}

impl FeedbackHandler for EpsilonGreedy {
    fn send_feedback(&self, feedback: &FeedbackRequest) -> ComponentResult<Vec<MetricRecord>> {
        let branch = feedback
            .routing
            .ok_or_else(|| ComponentFailure::new("feedback carries no routing decision for this router"))?;
        let branch = usize::try_from(branch)
            .map_err(|_| ComponentFailure::new(format!("invalid routed branch {branch}")))?;

        let (successes, failures) = split_reward(feedback.reward, feedback.features.rows());

        let current = self.store.get(&self.key)?;
        let mut state = match &current {
            Some(flat) => RouterState::from_flat(flat, self.n_branches)?,
            None => RouterState::new(self.n_branches),
        };
        state.record(branch, successes, failures)?;

        if !self
            .store
            .compare_and_swap(&self.key, current.as_deref(), state.to_flat())?
        {
            warn!(key = %self.key, branch, "Router state changed concurrently, update dropped");
            return Err(ComponentFailure::new("router state was modified concurrently"));
        }

        debug!(branch, successes, failures, "Recorded router feedback");
        Ok(vec![
            MetricRecord::counter("branch_success", successes as f64).with_tag("branch", branch.to_string()),
            MetricRecord::counter("branch_failure", failures as f64).with_tag("branch", branch.to_string()),
        ])
    }
}

impl MetricsSource for EpsilonGreedy {
    fn metrics(&self) -> Vec<MetricRecord> {
        match self.state() {
            Ok(state) => state
                .branches()
                .iter()
                .enumerate()
                .map(|(i, b)| MetricRecord::gauge("branch_value", b.value()).with_tag("branch", i.to_string()))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Router state unreadable, no branch metrics");
                Vec::new()
            }
        }
    }
}

impl TagsSource for EpsilonGreedy {
    fn tags(&self) -> BTreeMap<String, String> {
        let best = self
            .state()
            .map(|s| s.best_branch(self.fallback_branch))
            .unwrap_or(self.fallback_branch);
        BTreeMap::from([("best_branch".to_string(), best.to_string())])
    }
}

impl Component for EpsilonGreedy {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_loader(&self) -> Option<&dyn Loader> {
        Some(self)
    }

    fn as_router(&self) -> Option<&dyn Router> {
        Some(self)
    }

    fn as_feedback_handler(&self) -> Option<&dyn FeedbackHandler> {
        Some(self)
    }

    fn as_metrics_source(&self) -> Option<&dyn MetricsSource> {
        Some(self)
    }

    fn as_tags_source(&self) -> Option<&dyn TagsSource> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::artifacts::LocalArtifacts;

    fn config(n_branches: usize, epsilon: f64) -> BanditConfig {
        BanditConfig {
            n_branches,
            epsilon,
            seed: Some(7),
            best_branch: 0,
        }
    }

    fn router(n_branches: usize, epsilon: f64) -> (EpsilonGreedy, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let bandit = EpsilonGreedy::new(
            "router",
            &config(n_branches, epsilon),
            state_key("dep", "pred", "router"),
            store.clone(),
            Arc::new(LocalArtifacts),
        );
        (bandit, store)
    }

    fn feedback(rows: usize, reward: f64, branch: i64) -> FeedbackRequest {
        FeedbackRequest {
            features: CanonicalArray::from_shape_vec(&[rows, 1], vec![0.0f64; rows]).unwrap(),
            names: Vec::new(),
            response: None,
            truth: None,
            reward,
            routing: Some(branch),
        }
    }

    #[test]
    fn test_split_reward_conserves_rows() {
        assert_eq!(split_reward(0.5, 4), (2, 2));
        assert_eq!(split_reward(0.7, 3), (2, 1));
        assert_eq!(split_reward(5.0, 3), (3, 0));
        assert_eq!(split_reward(-1.0, 3), (0, 3));
        assert_eq!(split_reward(f64::NAN, 2), (0, 2));
        for rows in 0..20 {
            for step in 0..=10 {
                let (s, f) = split_reward(step as f64 / 10.0, rows);
                assert_eq!(s + f, rows as u64);
            }
        }
    }

    #[test]
    fn test_greedy_route_follows_feedback() {
        let (bandit, store) = router(3, 0.0);
        let x = CanonicalArray::from_shape_vec(&[1, 1], vec![1.0f64]).unwrap();
        assert_eq!(bandit.route(&x, &[]).unwrap(), 0);

        bandit.send_feedback(&feedback(4, 1.0, 2)).unwrap();
        bandit.send_feedback(&feedback(4, 0.25, 0)).unwrap();
        assert_eq!(bandit.route(&x, &[]).unwrap(), 2);

        let stored = store.get("dep_pred_router-beta-params").unwrap().unwrap();
        assert_eq!(stored, vec![1, 3, 0, 0, 4, 0]);
        assert_eq!(bandit.tags()["best_branch"], "2");
    }

    #[test]
    fn test_exploration_stays_in_range() {
        let (bandit, _) = router(3, 1.0);
        let x = CanonicalArray::from_shape_vec(&[1, 1], vec![1.0f64]).unwrap();
        for _ in 0..100 {
            let branch = bandit.route(&x, &[]).unwrap();
            assert!((0..3).contains(&branch));
        }
    }

    #[test]
    fn test_feedback_requires_routing() {
        let (bandit, _) = router(2, 0.0);
        let mut fb = feedback(1, 1.0, 0);
        fb.routing = None;
        assert!(bandit.send_feedback(&fb).is_err());
        assert!(bandit.send_feedback(&feedback(1, 1.0, 5)).is_err());
    }

    #[test]
    fn test_lost_update_is_reported() {
        struct Contended(InMemoryStateStore);
        impl StateStore for Contended {
            fn get(&self, key: &str) -> Result<Option<Vec<u64>>, ComponentFailure> {
                self.0.get(key)
            }
            fn compare_and_swap(&self, _: &str, _: Option<&[u64]>, _: Vec<u64>) -> Result<bool, ComponentFailure> {
                Ok(false)
            }
        }

        let bandit = EpsilonGreedy::new(
            "router",
            &config(2, 0.0),
            "k".to_string(),
            Arc::new(Contended(InMemoryStateStore::new())),
            Arc::new(LocalArtifacts),
        );
        let err = bandit.send_feedback(&feedback(2, 1.0, 1)).unwrap_err();
        assert!(err.message.contains("concurrently"));
    }

    #[test]
    fn test_metrics_per_branch() {
        let (bandit, _) = router(2, 0.0);
        bandit.send_feedback(&feedback(4, 0.5, 1)).unwrap();
        let metrics = bandit.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[1].value, 0.5);
        assert_eq!(metrics[1].tags["branch"], "1");
    }

    #[test]
    fn test_load_seeds_state_once() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("state.json");
        std::fs::write(&seed, "[1, 1, 9, 1]").unwrap();

        let (bandit, store) = router(2, 0.0);
        let bandit = bandit.with_seed_state(seed.to_str().unwrap());
        bandit.load().unwrap();
        assert_eq!(bandit.state().unwrap().best_branch(0), 1);

        store
            .compare_and_swap(bandit.state_key(), Some(&[1, 1, 9, 1]), vec![5, 0, 0, 5])
            .unwrap();
        bandit.load().unwrap();
        assert_eq!(bandit.state().unwrap().to_flat(), vec![5, 0, 0, 5]);
    }

    #[test]
    fn test_load_rejects_wrong_width() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("state.json");
        std::fs::write(&seed, "[1, 1]").unwrap();
        let (bandit, _) = router(2, 0.0);
        assert!(bandit.with_seed_state(seed.to_str().unwrap()).load().is_err());
    }
}
