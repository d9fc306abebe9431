//! YAML configuration.
//!
//! See [`schema`] for the file format and [`loader`] for search paths,
//! `${VAR}` substitution, environment overrides and validation.

pub mod error;
pub mod loader;
pub mod schema;

pub use error::ConfigError;
pub use loader::{
    apply_env_overrides, default_config_paths, find_config_file, load_config, load_effective,
    substitute_env_vars, validate,
};
pub use schema::{
    BanditConfig, ComponentConfig, ComponentKind, DeliverySection, EventMethod, EventsConfig,
    GatewayConfig, LimitsConfig, MetricsConfig, Protocol, UnitConfig,
};
