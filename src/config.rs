//! Server settings, read once from `ROOMD_*` environment variables.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::store::IsolationLevel;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub lock_ttl: Duration,
    pub lock_sweep_interval: Duration,
    pub isolation: IsolationLevel,
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roomd".into(),
            max_connections: 256,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            lock_ttl: Duration::from_secs(60),
            lock_sweep_interval: Duration::from_secs(10),
            isolation: IsolationLevel::Serializable,
            request_timeout: Duration::from_millis(5000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let isolation = match lookup("ROOMD_ISOLATION") {
            None => defaults.isolation,
            Some(raw) => {
                let level: IsolationLevel = raw.parse().map_err(ConfigError::Isolation)?;
                if level < IsolationLevel::RepeatableRead {
                    return Err(ConfigError::Isolation(format!(
                        "{level} cannot prevent double bookings; use serializable or repeatable_read"
                    )));
                }
                level
            }
        };

        let tls_cert = lookup("ROOMD_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("ROOMD_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Tls(
                "both ROOMD_TLS_CERT and ROOMD_TLS_KEY must be set, or neither".into(),
            ));
        }

        Ok(Self {
            port: lookup("ROOMD_PORT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.port),
            bind: lookup("ROOMD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("ROOMD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("ROOMD_PASSWORD").unwrap_or(defaults.password),
            max_connections: number("ROOMD_MAX_CONNECTIONS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_connections),
            metrics_port: lookup("ROOMD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls_cert,
            tls_key,
            lock_ttl: number("ROOMD_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_ttl),
            lock_sweep_interval: number("ROOMD_LOCK_SWEEP_SECS")
                .filter(|&n| n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_sweep_interval),
            isolation,
            request_timeout: number("ROOMD_REQUEST_TIMEOUT_MS")
                .filter(|&n| n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }

    /// TLS acceptor from the configured PEM files, or `None` when TLS is off.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Isolation(String),
    Tls(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Isolation(e) => write!(f, "ROOMD_ISOLATION: {e}"),
            ConfigError::Tls(e) => write!(f, "TLS: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.port, 5433);
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.isolation, IsolationLevel::Serializable);
        assert_eq!(c.lock_ttl, Duration::from_secs(60));
        assert_eq!(c.request_timeout, Duration::from_millis(5000));
        assert!(c.metrics_port.is_none());
        assert!(c.tls_acceptor().unwrap().is_none());
        assert_eq!(c.wal_path(), PathBuf::from("./data/reservations.wal"));
    }

    #[test]
    fn overrides_and_fallbacks() {
        let c = config(&[
            ("ROOMD_PORT", "6000"),
            ("ROOMD_MAX_CONNECTIONS", "not a number"),
            ("ROOMD_LOCK_TTL_SECS", "5"),
            ("ROOMD_LOCK_SWEEP_SECS", "0"),
            ("ROOMD_ISOLATION", "repeatable read"),
            ("ROOMD_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.lock_ttl, Duration::from_secs(5));
        assert_eq!(c.lock_sweep_interval, Duration::from_secs(10));
        assert_eq!(c.isolation, IsolationLevel::RepeatableRead);
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn weak_or_unknown_isolation_rejected() {
        assert!(matches!(
            config(&[("ROOMD_ISOLATION", "read_committed")]),
            Err(ConfigError::Isolation(_))
        ));
        assert!(matches!(
            config(&[("ROOMD_ISOLATION", "snapshot")]),
            Err(ConfigError::Isolation(_))
        ));
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(matches!(
            config(&[("ROOMD_TLS_CERT", "/tmp/cert.pem")]),
            Err(ConfigError::Tls(_))
        ));
    }
}
