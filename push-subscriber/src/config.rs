//! Configuration for the push server.
//!
//! Values can be built in code or read from the environment:
//!
//! - `PUSH_BIND_ADDRESS`: address to listen on (default `0.0.0.0`)
//! - `PUSH_PORT_RANGE`: `8080` or `8080-8090` (default `8080-8090`)

use std::net::{IpAddr, Ipv4Addr};

use crate::error::ConfigError;

const BIND_ADDRESS_VAR: &str = "PUSH_BIND_ADDRESS";
const PORT_RANGE_VAR: &str = "PUSH_PORT_RANGE";

/// Configuration for the [`PushServer`](crate::PushServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the server binds to
    /// Default: 0.0.0.0
    pub bind_address: IpAddr,

    /// Inclusive range of ports to try, first free one wins
    /// Default: (8080, 8090)
    pub port_range: (u16, u16),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range: (8080, 8090),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loopback only, on a port picked by the OS. Handy for tests.
    pub fn ephemeral() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: (0, 0),
        }
    }

    /// Set the port range to try.
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = (start, end);
        self
    }

    /// Read the configuration from `PUSH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(BIND_ADDRESS_VAR) {
            config.bind_address = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: BIND_ADDRESS_VAR,
                value: value.clone(),
            })?;
        }

        if let Some(value) = lookup(PORT_RANGE_VAR) {
            config.port_range = parse_port_range(&value).ok_or_else(|| ConfigError::InvalidEnv {
                name: PORT_RANGE_VAR,
                value: value.clone(),
            })?;
        }

        Ok(config)
    }
}

/// Parse `"8080"` or `"8080-8090"`.
fn parse_port_range(value: &str) -> Option<(u16, u16)> {
    let value = value.trim();
    let (start, end) = match value.split_once('-') {
        Some((start, end)) => (start.trim().parse().ok()?, end.trim().parse().ok()?),
        None => {
            let port = value.parse().ok()?;
            (port, port)
        }
    };
    (start <= end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.port_range, (8080, 8090));
        assert_eq!(ServerConfig::new(), config);
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("8080"), Some((8080, 8080)));
        assert_eq!(parse_port_range("3400-3500"), Some((3400, 3500)));
        assert_eq!(parse_port_range(" 3400 - 3500 "), Some((3400, 3500)));
        assert_eq!(parse_port_range("3500-3400"), None);
        assert_eq!(parse_port_range("abc"), None);
        assert_eq!(parse_port_range("70000"), None);
    }

    #[test]
    fn test_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PUSH_BIND_ADDRESS", "127.0.0.1"),
            ("PUSH_PORT_RANGE", "9000-9010"),
        ]))
        .unwrap();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.port_range, (9000, 9010));

        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_from_lookup_rejects_invalid_values() {
        let err = ServerConfig::from_lookup(lookup(&[("PUSH_BIND_ADDRESS", "not-an-ip")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                name: "PUSH_BIND_ADDRESS",
                ..
            }
        ));

        let err = ServerConfig::from_lookup(lookup(&[("PUSH_PORT_RANGE", "9010-9000")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                name: "PUSH_PORT_RANGE",
                ..
            }
        ));
    }
}
