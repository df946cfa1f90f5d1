//! Server settings read from `SLOTBOOK_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} as {expected}")]
    Malformed {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("SLOTBOOK_MAX_CONNECTIONS must be at least 1")]
    NoConnections,
    #[error("both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither")]
    HalfTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name of the built-in administrator.
    pub admin_user: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// `EnvFilter` directive for the log subscriber.
    pub log: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            admin_user: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            log: "info".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables take defaults; set but
    /// malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |var: &'static str, default: String| -> Result<String, ConfigError> {
            match lookup(var) {
                Some(v) if v.trim().is_empty() => Err(ConfigError::Empty(var)),
                Some(v) => Ok(v),
                None => Ok(default),
            }
        };

        let config = Self {
            bind: text("SLOTBOOK_BIND", defaults.bind)?,
            port: parsed(&lookup, "SLOTBOOK_PORT", "a port number")?.unwrap_or(defaults.port),
            data_dir: text("SLOTBOOK_DATA_DIR", defaults.data_dir.to_string_lossy().into_owned())?.into(),
            password: text("SLOTBOOK_PASSWORD", defaults.password)?,
            admin_user: text("SLOTBOOK_ADMIN_USER", defaults.admin_user)?,
            max_connections: parsed(&lookup, "SLOTBOOK_MAX_CONNECTIONS", "an integer")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", "an integer")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT", "a port number")?,
            tls_cert: lookup("SLOTBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("SLOTBOOK_TLS_KEY").map(PathBuf::from),
            log: text("SLOTBOOK_LOG", defaults.log)?,
        };

        if config.max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::HalfTls);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Malformed {
                var,
                value,
                expected,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_ADMIN_USER", "office"),
            ("SLOTBOOK_METRICS_PORT", " 9100 "),
            ("SLOTBOOK_LOG", "slotbook=debug"),
        ])
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(config.admin_user, "office");
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.log, "slotbook=debug");
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = from_pairs(&[("SLOTBOOK_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Malformed {
                var: "SLOTBOOK_MAX_CONNECTIONS",
                value: "lots".into(),
                expected: "an integer",
            }
        );
        assert!(from_pairs(&[("SLOTBOOK_PORT", "70000")]).is_err());
    }

    #[test]
    fn zero_connections_rejected() {
        assert_eq!(
            from_pairs(&[("SLOTBOOK_MAX_CONNECTIONS", "0")]).unwrap_err(),
            ConfigError::NoConnections
        );
    }

    #[test]
    fn tls_needs_both_files() {
        assert_eq!(
            from_pairs(&[("SLOTBOOK_TLS_CERT", "cert.pem")]).unwrap_err(),
            ConfigError::HalfTls
        );
        let config = from_pairs(&[("SLOTBOOK_TLS_CERT", "cert.pem"), ("SLOTBOOK_TLS_KEY", "key.pem")]).unwrap();
        assert_eq!(config.tls_key, Some(PathBuf::from("key.pem")));
    }

    #[test]
    fn empty_password_rejected() {
        assert_eq!(
            from_pairs(&[("SLOTBOOK_PASSWORD", "")]).unwrap_err(),
            ConfigError::Empty("SLOTBOOK_PASSWORD")
        );
    }
}
