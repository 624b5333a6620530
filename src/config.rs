use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::RoleMap;
use crate::saga::{RemoteEndpoint, SagaPolicy};

/// Process configuration, read once from `RESERVOIR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub admin_users: Vec<String>,
    pub saga: SagaPolicy,
    pub saga_sweep_interval: Duration,
    /// Sibling instance that owns reservations. `None` reserves in-process.
    pub remote: Option<RemoteEndpoint>,
}

#[derive(Debug, thiserror::Error)]
#[error("{var}: cannot parse {value:?}")]
pub struct ConfigError {
    var: &'static str,
    value: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables take defaults; set
    /// but malformed ones are an error rather than a silent default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());
        let parsed = |var: &'static str| -> Result<Option<u64>, ConfigError> { parse(var, get(var)) };

        let defaults = SagaPolicy::default();
        let millis = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parsed(var)?.map_or(default, Duration::from_millis))
        };
        let saga = SagaPolicy {
            step_timeout: millis("RESERVOIR_SAGA_STEP_TIMEOUT_MS", defaults.step_timeout)?,
            payment_timeout: millis("RESERVOIR_SAGA_PAYMENT_TIMEOUT_MS", defaults.payment_timeout)?,
            compensation_attempts: parse("RESERVOIR_SAGA_COMPENSATION_ATTEMPTS", get("RESERVOIR_SAGA_COMPENSATION_ATTEMPTS"))?
                .unwrap_or(defaults.compensation_attempts),
            backoff: millis("RESERVOIR_SAGA_BACKOFF_MS", defaults.backoff)?,
        };

        let remote = match get("RESERVOIR_REMOTE_HOST") {
            Some(host) => Some(RemoteEndpoint {
                host,
                port: parse("RESERVOIR_REMOTE_PORT", get("RESERVOIR_REMOTE_PORT"))?.unwrap_or(5433),
                password: get("RESERVOIR_REMOTE_PASSWORD").unwrap_or_else(|| "reservoir".into()),
            }),
            None => None,
        };

        Ok(Self {
            port: parse("RESERVOIR_PORT", get("RESERVOIR_PORT"))?.unwrap_or(5433),
            bind: get("RESERVOIR_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("RESERVOIR_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("RESERVOIR_PASSWORD").unwrap_or_else(|| "reservoir".into()),
            max_connections: parse("RESERVOIR_MAX_CONNECTIONS", get("RESERVOIR_MAX_CONNECTIONS"))?
                .unwrap_or(256),
            compact_threshold: parsed("RESERVOIR_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parse("RESERVOIR_METRICS_PORT", get("RESERVOIR_METRICS_PORT"))?,
            admin_users: get("RESERVOIR_ADMIN_USERS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            saga,
            saga_sweep_interval: millis("RESERVOIR_SAGA_SWEEP_MS", Duration::from_secs(30))?,
            remote,
        })
    }

    pub fn role_map(&self) -> RoleMap {
        RoleMap::new(self.admin_users.iter().cloned())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value: v }),
    }
}
