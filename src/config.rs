//! Listener configuration.
//!
//! The TCP bind address comes from `TCP_SERVER_ADDRESS` when set; both
//! addresses can be overridden on the command line. Bare `:port` forms
//! (the conventional shorthand in deployment configs) are expanded to
//! `0.0.0.0:port`.

use crate::constants::{DEFAULT_HTTP_ADDR, DEFAULT_TCP_ADDR};

/// Resolved listener addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Device-facing TCP listener.
    pub tcp_addr: String,
    /// Desk-facing HTTP listener (`/ws`, `/health`).
    pub http_addr: String,
}

impl Config {
    /// Build from the environment, falling back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let tcp_addr = std::env::var("TCP_SERVER_ADDRESS")
            .ok()
            .filter(|addr| !addr.is_empty())
            .map(|addr| normalize_addr(&addr))
            .unwrap_or_else(|| DEFAULT_TCP_ADDR.to_string());

        Self {
            tcp_addr,
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_addr: DEFAULT_TCP_ADDR.to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
        }
    }
}

/// Expand `:8091` shorthand to an address tokio can bind.
#[must_use]
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bare_port() {
        assert_eq!(normalize_addr(":8091"), "0.0.0.0:8091");
    }

    #[test]
    fn test_normalize_full_addr_unchanged() {
        assert_eq!(normalize_addr("127.0.0.1:9000"), "127.0.0.1:9000");
        assert_eq!(normalize_addr("0.0.0.0:8080"), "0.0.0.0:8080");
    }

    #[test]
    fn test_default_addresses() {
        let config = Config::default();
        assert_eq!(config.tcp_addr, DEFAULT_TCP_ADDR);
        assert_eq!(config.http_addr, DEFAULT_HTTP_ADDR);
    }

    #[test]
    fn test_from_env_respects_tcp_server_address() {
        std::env::set_var("TCP_SERVER_ADDRESS", ":7070");
        let config = Config::from_env();
        assert_eq!(config.tcp_addr, "0.0.0.0:7070");
        std::env::remove_var("TCP_SERVER_ADDRESS");

        assert_eq!(Config::from_env().tcp_addr, DEFAULT_TCP_ADDR);
    }
}
