use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;
use thiserror::Error;

use crate::engine::ExpiryWindows;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}'")]
    Invalid { var: &'static str, value: String },
    #[error("both TOURDESK_TLS_CERT and TOURDESK_TLS_KEY must be set, or neither")]
    TlsPair,
}

/// Server settings, read once from `TOURDESK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Zero disables the window.
    pub guide_decision_hours: u64,
    pub payment_window_hours: u64,
    pub reaper_interval: Duration,
    pub checkout_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());

        let tls_cert = lookup("TOURDESK_TLS_CERT");
        let tls_key = lookup("TOURDESK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            port: parse_or(&lookup, "TOURDESK_PORT", 5433)?,
            bind: text("TOURDESK_BIND", "0.0.0.0"),
            data_dir: PathBuf::from(text("TOURDESK_DATA_DIR", "./data")),
            password: text("TOURDESK_PASSWORD", "tourdesk"),
            max_connections: parse_or(&lookup, "TOURDESK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "TOURDESK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: lookup("TOURDESK_METRICS_PORT")
                .map(|v| parse_value("TOURDESK_METRICS_PORT", v))
                .transpose()?,
            tls_cert,
            tls_key,
            guide_decision_hours: parse_or(&lookup, "TOURDESK_GUIDE_DECISION_HOURS", 72)?,
            payment_window_hours: parse_or(&lookup, "TOURDESK_PAYMENT_WINDOW_HOURS", 24)?,
            reaper_interval: Duration::from_secs(parse_or(&lookup, "TOURDESK_REAPER_INTERVAL_SECS", 5)?.max(1)),
            checkout_base_url: text("TOURDESK_CHECKOUT_BASE_URL", "http://localhost:8080/checkout"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tourdesk.wal")
    }

    pub fn expiry_windows(&self) -> ExpiryWindows {
        ExpiryWindows::from_hours(self.guide_decision_hours, self.payment_window_hours)
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parse_value<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => parse_value(var, value),
        None => Ok(default),
    }
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => return Err(io::Error::new(ErrorKind::InvalidInput, ConfigError::TlsPair)),
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
