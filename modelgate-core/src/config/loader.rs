//! Configuration loading and validation.
//!
//! Loading flow: locate file, read, reject empty, substitute `${VAR}`
//! references, parse YAML, apply environment overrides, validate.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use tracing::warn;

use super::error::ConfigError;
use super::schema::{ComponentKind, GatewayConfig};

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("MODELGATE_CONFIG") {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/modelgate/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file from the search paths.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::ConfigFileNotFound { searched: paths })
}

/// Load configuration from a file path. No overrides or validation.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }
    let contents = substitute_env_vars(&contents)?;
    let config: GatewayConfig = serde_saphyr::from_str(&contents)?;
    Ok(config)
}

/// Resolves the effective configuration.
///
/// An explicit path must exist. Without one, the default search paths are
/// tried and built-in defaults are used when none exists.
pub fn load_effective(explicit_path: Option<&Path>) -> Result<(GatewayConfig, Option<PathBuf>), ConfigError> {
    let (mut config, source) = match find_config_file(explicit_path) {
        Ok(path) => (load_config(&path)?, Some(path)),
        Err(ConfigError::ConfigFileNotFound { .. }) if explicit_path.is_none() => {
            (GatewayConfig::default(), None)
        }
        Err(e) => return Err(e),
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok((config, source))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern.
// The pattern is known-valid and tested by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// - `${VAR}` - required, fails if not set
/// - `${VAR:-default}` - optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = cap.get(1).map_or("", |m| m.as_str());
        match (std::env::var(var_name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        }),
        None => Ok(result.into_owned()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_nonempty(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = env_nonempty(name)?;
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => {
            warn!(var = name, value = %raw, "Ignoring unparseable boolean override");
            None
        }
    }
}

/// Applies environment overrides.
///
/// # Environment Variables
///
/// - `PREDICTIVE_UNIT_ID`, `PREDICTIVE_UNIT_IMAGE`: unit identity
/// - `INCLUDE_METRICS_IN_CLIENT_RESPONSE`: copy metrics into `meta`
/// - `MODELGATE_REPLY_URL`: reply target
/// - `MODELGATE_DELIVERY_TIMEOUT_SECS`, `MODELGATE_DELIVERY_MAX_ATTEMPTS`
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Some(id) = env_nonempty("PREDICTIVE_UNIT_ID") {
        config.unit.id = Some(id);
    }
    if let Some(image) = env_nonempty("PREDICTIVE_UNIT_IMAGE") {
        config.unit.image = Some(image);
    }
    if let Some(include) = env_bool("INCLUDE_METRICS_IN_CLIENT_RESPONSE") {
        config.metrics.include_in_response = include;
    }
    if let Some(url) = env_nonempty("MODELGATE_REPLY_URL") {
        config.delivery.reply_url = Some(url);
    }
    if let Some(secs) = env_parsed("MODELGATE_DELIVERY_TIMEOUT_SECS") {
        config.delivery.timeout_secs = secs;
    }
    if let Some(attempts) = env_parsed("MODELGATE_DELIVERY_MAX_ATTEMPTS") {
        config.delivery.max_attempts = attempts;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    if config.component.name.trim().is_empty() {
        return Err(ConfigError::invalid("component.name", "must not be empty"));
    }

    if config.component.kind == ComponentKind::EpsilonGreedy {
        let bandit = config
            .component
            .bandit
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSection {
                section: "component.bandit".to_string(),
                reason: "kind is epsilon_greedy".to_string(),
            })?;
        if bandit.n_branches < 1 {
            return Err(ConfigError::invalid("component.bandit.n_branches", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&bandit.epsilon) {
            return Err(ConfigError::invalid(
                "component.bandit.epsilon",
                format!("{} is not within [0, 1]", bandit.epsilon),
            ));
        }
        if bandit.best_branch >= bandit.n_branches {
            return Err(ConfigError::invalid(
                "component.bandit.best_branch",
                "must be below n_branches",
            ));
        }
    }

    if config.events.drift_batch_size == Some(0) {
        return Err(ConfigError::invalid("events.drift_batch_size", "must be >= 1"));
    }

    let delivery = &config.delivery;
    if let Some(url) = delivery.reply_url.as_deref().filter(|u| !u.is_empty()) {
        reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
    }
    if delivery.max_attempts < 1 {
        return Err(ConfigError::invalid("delivery.max_attempts", "must be >= 1"));
    }
    if delivery.initial_backoff_ms > delivery.max_backoff_ms {
        return Err(ConfigError::invalid(
            "delivery.initial_backoff_ms",
            "must not exceed max_backoff_ms",
        ));
    }

    if config.limits.max_message_bytes == 0 {
        return Err(ConfigError::invalid("limits.max_message_bytes", "must be > 0"));
    }
    if config.limits.max_body_bytes == 0 {
        return Err(ConfigError::invalid("limits.max_body_bytes", "must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_VARS: &[&str] = &[
        "PREDICTIVE_UNIT_ID",
        "PREDICTIVE_UNIT_IMAGE",
        "INCLUDE_METRICS_IN_CLIENT_RESPONSE",
        "MODELGATE_REPLY_URL",
        "MODELGATE_DELIVERY_TIMEOUT_SECS",
        "MODELGATE_DELIVERY_MAX_ATTEMPTS",
        "MODELGATE_CONFIG",
    ];

    /// RAII guard that clears the given vars and restores them on drop.
    struct EnvVarGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvVarGuard {
        fn cleared(var_names: &[&'static str]) -> Self {
            let vars = var_names
                .iter()
                .map(|&name| (name, std::env::var(name).ok()))
                .collect();
            // SAFETY: serialized by #[serial]
            unsafe {
                for name in var_names {
                    std::env::remove_var(name);
                }
            }
            Self { vars }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            for (name, original) in &self.vars {
                // SAFETY: serialized by #[serial]
                unsafe {
                    match original {
                        Some(val) => std::env::set_var(name, val),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    /// Verify the LazyLock regex compiles successfully.
    #[test]
    fn test_env_var_pattern_compiles() {
        let _ = &*ENV_VAR_PATTERN;
    }

    #[test]
    #[serial]
    fn test_env_var_substitution() {
        let _guard = EnvVarGuard::cleared(&["MG_TEST_URL", "MG_MISSING"]);
        // SAFETY: serialized by #[serial]
        unsafe {
            std::env::set_var("MG_TEST_URL", "http://sink");
        }
        assert_eq!(
            substitute_env_vars("url: ${MG_TEST_URL}").unwrap(),
            "url: http://sink"
        );
        assert_eq!(
            substitute_env_vars("url: ${MG_MISSING:-http://default}").unwrap(),
            "url: http://default"
        );
        assert!(matches!(
            substitute_env_vars("url: ${MG_MISSING}"),
            Err(ConfigError::MissingEnvVar { var, .. }) if var == "MG_MISSING"
        ));
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = write_config("   \n");
        assert!(matches!(load_config(file.path()), Err(ConfigError::EmptyConfigFile)));
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let result = find_config_file(Some(Path::new("/nonexistent/modelgate.yaml")));
        assert!(matches!(result, Err(ConfigError::ConfigFileNotFound { .. })));
        assert!(load_effective(Some(Path::new("/nonexistent/modelgate.yaml"))).is_err());
    }

    #[test]
    #[serial]
    fn test_load_effective_from_file_with_overrides() {
        let _guard = EnvVarGuard::cleared(ENV_VARS);
        let file = write_config("events:\n  drift_batch_size: 2\nunit:\n  id: from-file\n");
        // SAFETY: serialized by #[serial]
        unsafe {
            std::env::set_var("PREDICTIVE_UNIT_ID", "from-env");
            std::env::set_var("INCLUDE_METRICS_IN_CLIENT_RESPONSE", "false");
            std::env::set_var("MODELGATE_DELIVERY_MAX_ATTEMPTS", "lots");
        }

        let (config, source) = load_effective(Some(file.path())).unwrap();
        assert_eq!(source.as_deref(), Some(file.path()));
        assert_eq!(config.events.drift_batch_size, Some(2));
        assert_eq!(config.unit.id.as_deref(), Some("from-env"));
        assert!(!config.metrics.include_in_response);
        assert_eq!(config.delivery.max_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.events.drift_batch_size = Some(0);
        assert!(validate(&config).is_err());

        let mut config = GatewayConfig::default();
        config.component.kind = ComponentKind::EpsilonGreedy;
        assert!(matches!(validate(&config), Err(ConfigError::MissingSection { .. })));

        let yaml = "component:\n  kind: epsilon_greedy\n  bandit:\n    n_branches: 2\n    epsilon: 1.5\n";
        let config: GatewayConfig = serde_saphyr::from_str(yaml).unwrap();
        assert!(validate(&config).is_err());

        let mut config = GatewayConfig::default();
        config.delivery.initial_backoff_ms = 10_000;
        assert!(validate(&config).is_err());

        let mut config = GatewayConfig::default();
        config.delivery.reply_url = Some("not a url".into());
        assert!(matches!(validate(&config), Err(ConfigError::InvalidUrl { .. })));

        let mut config = GatewayConfig::default();
        config.limits.max_message_bytes = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_defaults_validate() {
        assert!(validate(&GatewayConfig::default()).is_ok());
    }
}
