use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use tracing::warn;

/// Library-level settings for one [`crate::engine::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Zone in which rule dates and times are interpreted.
    pub tz: Tz,
    /// Longest wait for the planning lock before giving up with `Busy`.
    pub lock_timeout: Duration,
    /// Pending transition triggers kept before new ones are dropped.
    pub trigger_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tz: Tz::UTC,
            lock_timeout: Duration::from_millis(1_000),
            trigger_queue: 1_024,
        }
    }
}

/// Daemon settings, read from `VENUEPLAN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub users_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = EngineConfig::default();

        let tz = match get("VENUEPLAN_TIMEZONE") {
            Some(name) => Tz::from_str(&name).map_err(|_| format!("unknown time zone: {name}"))?,
            None => defaults.tz,
        };
        let lock_timeout = parsed(&get, "VENUEPLAN_LOCK_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);
        let trigger_queue = parsed(&get, "VENUEPLAN_TRIGGER_QUEUE").unwrap_or(defaults.trigger_queue);

        Ok(Self {
            data_dir: PathBuf::from(get("VENUEPLAN_DATA_DIR").unwrap_or_else(|| "./data".into())),
            engine: EngineConfig {
                tz,
                lock_timeout,
                trigger_queue,
            },
            compact_threshold: parsed(&get, "VENUEPLAN_COMPACT_THRESHOLD").unwrap_or(1_000),
            metrics_port: parsed(&get, "VENUEPLAN_METRICS_PORT"),
            users_file: get("VENUEPLAN_USERS_FILE").map(PathBuf::from),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("plan.wal")
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw}: not a valid value");
            None
        }
    }
}
