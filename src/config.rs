use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::{SchedulerConfig, WorkingHoursPolicy};

/// Server settings, read from `SLOTBOOK_*` environment variables.
///
/// | variable                     | default   |
/// |------------------------------|-----------|
/// | `SLOTBOOK_PORT`              | `5433`    |
/// | `SLOTBOOK_BIND`              | `0.0.0.0` |
/// | `SLOTBOOK_DATA_DIR`          | `./data`  |
/// | `SLOTBOOK_PASSWORD`          | `slotbook`|
/// | `SLOTBOOK_MAX_CONNECTIONS`   | `256`     |
/// | `SLOTBOOK_COMPACT_THRESHOLD` | `1000`    |
/// | `SLOTBOOK_TLS_CERT` / `_KEY` | unset     |
/// | `SLOTBOOK_METRICS_PORT`      | unset     |
/// | `SLOTBOOK_SLOT_MINUTES`      | `30`      |
/// | `SLOTBOOK_STORE_TIMEOUT_MS`  | `5000`    |
/// | `SLOTBOOK_WORKING_HOURS`     | `allow`   |
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the
    /// default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let defaults = SchedulerConfig::default();
        let slot_minutes = parse_or_warn("SLOTBOOK_SLOT_MINUTES", get("SLOTBOOK_SLOT_MINUTES"))
            .filter(|m: &u32| {
                let ok = *m > 0;
                if !ok {
                    warn!("SLOTBOOK_SLOT_MINUTES must be positive, using {}", defaults.slot_minutes);
                }
                ok
            })
            .unwrap_or(defaults.slot_minutes);
        let store_timeout =
            parse_or_warn("SLOTBOOK_STORE_TIMEOUT_MS", get("SLOTBOOK_STORE_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout);
        let working_hours: WorkingHoursPolicy =
            parse_or_warn("SLOTBOOK_WORKING_HOURS", get("SLOTBOOK_WORKING_HOURS"))
                .unwrap_or(defaults.working_hours);

        Self {
            port: parse_or_warn("SLOTBOOK_PORT", get("SLOTBOOK_PORT")).unwrap_or(5433),
            bind: get("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: get("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parse_or_warn("SLOTBOOK_MAX_CONNECTIONS", get("SLOTBOOK_MAX_CONNECTIONS"))
                .unwrap_or(256),
            compact_threshold: parse_or_warn(
                "SLOTBOOK_COMPACT_THRESHOLD",
                get("SLOTBOOK_COMPACT_THRESHOLD"),
            )
            .unwrap_or(1000),
            tls_cert: get("SLOTBOOK_TLS_CERT"),
            tls_key: get("SLOTBOOK_TLS_KEY"),
            metrics_port: parse_or_warn("SLOTBOOK_METRICS_PORT", get("SLOTBOOK_METRICS_PORT")),
            scheduler: SchedulerConfig {
                slot_minutes,
                store_timeout,
                working_hours,
            },
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn parse_or_warn<T: FromStr>(key: &str, raw: Option<String>) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("ignoring {key}={raw:?}: {e}");
            None
        }
    }
}
