//! Built-in components selectable from configuration.

pub mod artifacts;
pub mod bandit;
pub mod identity;

pub use artifacts::{ArtifactSource, LocalArtifacts};
pub use bandit::{EpsilonGreedy, InMemoryStateStore, RouterState, StateStore};
pub use identity::Identity;

use std::sync::Arc;

use crate::config::{ComponentConfig, ComponentKind, ConfigError, UnitConfig};
use crate::dispatch::Component;

/// Builds the configured component. Bandit routers keep their state in
/// `store`.
pub fn build_component(
    config: &ComponentConfig,
    unit: &UnitConfig,
    store: Arc<dyn StateStore>,
) -> Result<Arc<dyn Component>, ConfigError> {
    match config.kind {
        ComponentKind::Identity => Ok(Arc::new(Identity::new(config.name.clone()))),
        ComponentKind::EpsilonGreedy => {
            let bandit = config.bandit.as_ref().ok_or_else(|| ConfigError::MissingSection {
                section: "component.bandit".to_string(),
                reason: "required for epsilon_greedy".to_string(),
            })?;
            let key = bandit::state_key(
                unit.deployment.as_deref().unwrap_or("default"),
                unit.predictor.as_deref().unwrap_or("default"),
                unit.id_or(&config.name),
            );
            let mut router = EpsilonGreedy::new(
                config.name.clone(),
                bandit,
                key,
                store,
                Arc::new(LocalArtifacts),
            );
            if let Some(uri) = &config.storage_uri {
                router = router.with_seed_state(uri.clone());
            }
            Ok(Arc::new(router))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BanditConfig;
    use crate::dispatch::{Capabilities, Dispatcher};

    #[test]
    fn test_identity_by_default() {
        let component = build_component(
            &ComponentConfig::default(),
            &UnitConfig::default(),
            Arc::new(InMemoryStateStore::new()),
        )
        .unwrap();
        let caps = Dispatcher::register(component).capabilities();
        assert!(caps.contains(Capabilities::PREDICT));
        assert!(!caps.contains(Capabilities::ROUTE));
    }

    #[test]
    fn test_bandit_requires_section() {
        let config = ComponentConfig {
            kind: ComponentKind::EpsilonGreedy,
            ..ComponentConfig::default()
        };
        let result = build_component(&config, &UnitConfig::default(), Arc::new(InMemoryStateStore::new()));
        assert!(matches!(result, Err(ConfigError::MissingSection { .. })));
    }

    #[test]
    fn test_bandit_capabilities() {
        let config = ComponentConfig {
            name: "router".to_string(),
            kind: ComponentKind::EpsilonGreedy,
            storage_uri: None,
            bandit: Some(BanditConfig {
                n_branches: 2,
                epsilon: 0.1,
                seed: None,
                best_branch: 0,
            }),
        };
        let component =
            build_component(&config, &UnitConfig::default(), Arc::new(InMemoryStateStore::new())).unwrap();
        let caps = Dispatcher::register(component).capabilities();
        assert!(caps.contains(Capabilities::ROUTE));
        assert!(caps.contains(Capabilities::SEND_FEEDBACK));
        assert!(caps.contains(Capabilities::LOAD));
    }
}
