use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::engine::{CancellationPolicy, EngineOptions};

/// Process configuration, read once at startup from `ROOMD_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    pub payment_required: bool,
    pub cancellation_policy: CancellationPolicy,
    pub checkout_ttl_secs: i64,
    pub webhook_secret: String,
    pub currency: String,
    pub lock_timeout: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both ROOMD_TLS_CERT and ROOMD_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("tls: {0}")]
    Tls(#[from] io::Error),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset and empty variables
    /// take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let tls = match (get("ROOMD_TLS_CERT"), get("ROOMD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };
        let metrics_port = match get("ROOMD_METRICS_PORT") {
            Some(v) => Some(parse_value("ROOMD_METRICS_PORT", &v)?),
            None => None,
        };

        Ok(Self {
            bind: get("ROOMD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "ROOMD_PORT", 5433)?,
            data_dir: get("ROOMD_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("ROOMD_PASSWORD").unwrap_or_else(|| "roomd".into()),
            max_connections: parse_or(&get, "ROOMD_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "ROOMD_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            tls,
            payment_required: parse_or(&get, "ROOMD_PAYMENT_REQUIRED", false)?,
            cancellation_policy: parse_or(&get, "ROOMD_CANCELLATION_POLICY", CancellationPolicy::Lenient)?,
            checkout_ttl_secs: parse_or(&get, "ROOMD_CHECKOUT_TTL_SECS", 1800)?,
            webhook_secret: get("ROOMD_WEBHOOK_SECRET").unwrap_or_else(|| "whsec_dev".into()),
            currency: get("ROOMD_CURRENCY")
                .unwrap_or_else(|| "aud".into())
                .to_ascii_lowercase(),
            lock_timeout: Duration::from_millis(parse_or(&get, "ROOMD_LOCK_TIMEOUT_MS", 5000)?),
            sweep_interval: Duration::from_secs(parse_or(&get, "ROOMD_SWEEP_INTERVAL_SECS", 30)?),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomd.wal")
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            payment_required: self.payment_required,
            cancellation_policy: self.cancellation_policy,
            checkout_ttl: chrono::Duration::seconds(self.checkout_ttl_secs),
            lock_timeout: self.lock_timeout,
            currency: self.currency.clone(),
        }
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        match &self.tls {
            Some(paths) => Ok(Some(load_tls_acceptor(paths)?)),
            None => Ok(None),
        }
    }
}

fn parse_value<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(v) => parse_value(var, &v),
        None => Ok(default),
    }
}

fn load_tls_acceptor(paths: &TlsPaths) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&paths.cert)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&paths.key)?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
