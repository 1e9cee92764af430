use std::path::PathBuf;
use std::time::Duration;

/// Delivery knobs for operational notices.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub channel: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel: "ops".into(),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Engine configuration. Every field has a default, and every field can
/// be overridden from a `NUMPOOL_*` environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Upper bound on how many numbers a random pick may claim at once.
    pub pick_cap: usize,
    pub sweep_interval: Duration,
    /// WAL records accumulated before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub notify: NotifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pick_cap: crate::limits::MAX_RANDOM_PICK,
            sweep_interval: Duration::from_secs(5),
            compact_threshold: 1000,
            metrics_port: None,
            notify: NotifyConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let notify_defaults = NotifyConfig::default();
        Self {
            data_dir: std::env::var("NUMPOOL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            pick_cap: env_parse("NUMPOOL_PICK_CAP").unwrap_or(defaults.pick_cap),
            sweep_interval: env_parse("NUMPOOL_SWEEP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            compact_threshold: env_parse("NUMPOOL_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: env_parse("NUMPOOL_METRICS_PORT"),
            notify: NotifyConfig {
                channel: std::env::var("NUMPOOL_NOTIFY_CHANNEL")
                    .unwrap_or(notify_defaults.channel),
                max_retries: env_parse("NUMPOOL_NOTIFY_RETRIES")
                    .unwrap_or(notify_defaults.max_retries),
                retry_delay: env_parse("NUMPOOL_NOTIFY_RETRY_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(notify_defaults.retry_delay),
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("pool.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.pick_cap, 50);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/pool.wal"));
        assert_eq!(cfg.notify.max_retries, 3);
    }
}
