//! Listener ports.
//!
//! | Port | Surface | Env variable |
//! |------|---------|--------------|
//! | 9000 | REST (JSON, V2, CloudEvents) | `MODELGATE_HTTP_PORT` |
//! | 5000 | Binary RPC | `MODELGATE_RPC_PORT` |
//! | 5001 | Columnar frames | `MODELGATE_COLUMNAR_PORT` |
//! | 6000 | Admin (`/health`, `/ready`, `/metrics`) | `MODELGATE_ADMIN_PORT` |

use tracing::warn;

pub const DEFAULT_HTTP_PORT: u16 = 9000;

pub const DEFAULT_RPC_PORT: u16 = 5000;

pub const DEFAULT_COLUMNAR_PORT: u16 = 5001;

/// Default admin port.
///
/// Endpoints served on this port:
/// - `GET /health` - Liveness probe
/// - `GET /ready` - Readiness probe
/// - `GET /metrics` - Prometheus metrics
pub const DEFAULT_ADMIN_PORT: u16 = 6000;

fn port_from_env(var: &str, default: u16) -> u16 {
    match std::env::var(var) {
        Ok(value) => match value.parse() {
            Ok(port) => port,
            Err(_) => {
                warn!(env_var = var, value = %value, default, "Invalid port, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// REST port from `MODELGATE_HTTP_PORT` or the default.
///
/// # Example
///
/// ```rust
/// use modelgate_server::ports::http_port;
///
/// let port = http_port();
/// assert!(port > 0);
/// ```
pub fn http_port() -> u16 {
    port_from_env("MODELGATE_HTTP_PORT", DEFAULT_HTTP_PORT)
}

pub fn rpc_port() -> u16 {
    port_from_env("MODELGATE_RPC_PORT", DEFAULT_RPC_PORT)
}

pub fn columnar_port() -> u16 {
    port_from_env("MODELGATE_COLUMNAR_PORT", DEFAULT_COLUMNAR_PORT)
}

pub fn admin_port() -> u16 {
    port_from_env("MODELGATE_ADMIN_PORT", DEFAULT_ADMIN_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvVarGuard {
        key: &'static str,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            // SAFETY: tests touching the environment are serialized.
            unsafe { std::env::set_var(key, value) };
            Self { key }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            // SAFETY: see `set`.
            unsafe { std::env::remove_var(self.key) };
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        assert_eq!(http_port(), DEFAULT_HTTP_PORT);
        assert_eq!(rpc_port(), DEFAULT_RPC_PORT);
        assert_eq!(columnar_port(), DEFAULT_COLUMNAR_PORT);
        assert_eq!(admin_port(), DEFAULT_ADMIN_PORT);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        let _guard = EnvVarGuard::set("MODELGATE_RPC_PORT", "7100");
        assert_eq!(rpc_port(), 7100);
    }

    #[test]
    #[serial]
    fn test_invalid_env_falls_back() {
        let _guard = EnvVarGuard::set("MODELGATE_ADMIN_PORT", "not-a-port");
        assert_eq!(admin_port(), DEFAULT_ADMIN_PORT);
    }
}
