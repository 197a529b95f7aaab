//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use keypod_core::protocol::DEFAULT_SERVICE;
use keypod_core::session::PoolParams;
use keypod_core::Curve;
use serde::Deserialize;
use tracing::{debug, warn};

/// Daemon configuration. File: ~/.config/keypod/config.toml or /etc/keypod/config.toml.
/// Env overrides: KEYPOD_NAME, KEYPOD_HOST, KEYPOD_DISCOVERY_PORT, KEYPOD_TRANSPORT_PORT,
/// KEYPOD_DATA_DIR, KEYPOD_CURVE, KEYPOD_POOL_CAPACITY, KEYPOD_AUTO_PAIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Advertised instance name (default: $HOSTNAME, else "keypod").
    #[serde(default = "default_name")]
    pub name: String,
    /// Host name put in query responses, e.g. "mac-studio.local". Unset: peers use our IP.
    #[serde(default)]
    pub advertised_host: Option<String>,
    #[serde(default = "default_service")]
    pub service: String,
    /// Discovery UDP port (default 45878).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 45879).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// "x25519" or "ed25519".
    #[serde(default = "default_curve")]
    pub curve: String,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: u32,
    /// Holds the redb database (default ~/.local/share/keypod, else /var/lib/keypod).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_auto_pair")]
    pub auto_pair: bool,
    #[serde(default = "default_beacon_interval_secs")]
    pub beacon_interval_secs: u64,
    /// Adverts not refreshed within this window are dropped.
    #[serde(default = "default_advert_expiry_secs")]
    pub advert_expiry_secs: u64,
}

fn default_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "keypod".to_string())
}
fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}
fn default_discovery_port() -> u16 {
    45878
}
fn default_transport_port() -> u16 {
    45879
}
fn default_step_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_wait_timeout_secs() -> u64 {
    5
}
fn default_curve() -> String {
    Curve::X25519.name().to_string()
}
fn default_pool_capacity() -> u32 {
    64
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/keypod"),
        None => PathBuf::from("/var/lib/keypod"),
    }
}
fn default_auto_pair() -> bool {
    true
}
fn default_beacon_interval_secs() -> u64 {
    4
}
fn default_advert_expiry_secs() -> u64 {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            advertised_host: None,
            service: default_service(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            step_timeout_secs: default_step_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_secs: default_wait_timeout_secs(),
            curve: default_curve(),
            pool_capacity: default_pool_capacity(),
            data_dir: default_data_dir(),
            auto_pair: default_auto_pair(),
            beacon_interval_secs: default_beacon_interval_secs(),
            advert_expiry_secs: default_advert_expiry_secs(),
        }
    }
}

impl Config {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs)
    }

    pub fn advert_expiry(&self) -> Duration {
        Duration::from_secs(self.advert_expiry_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("keypod.redb")
    }

    /// Pool parameters for new relationships.
    pub fn pool_params(&self) -> Result<PoolParams, ConfigError> {
        let curve = Curve::from_str(&self.curve).map_err(|e| ConfigError::Invalid {
            field: "curve",
            reason: e.to_string(),
        })?;
        let params = PoolParams {
            curve,
            capacity: self.pool_capacity,
        };
        params.validate().map_err(|e| ConfigError::Invalid {
            field: "pool_capacity",
            reason: e.to_string(),
        })?;
        Ok(params)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.contains('|') {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must be non-empty and must not contain '|'".into(),
            });
        }
        let positive = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("beacon_interval_secs", self.beacon_interval_secs),
            ("step_timeout_secs", self.step_timeout_secs),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be positive".into(),
            });
        }
        if self.advert_expiry_secs <= self.beacon_interval_secs {
            return Err(ConfigError::Invalid {
                field: "advert_expiry_secs",
                reason: "must exceed beacon_interval_secs".into(),
            });
        }
        self.pool_params().map(|_| ())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Load config: defaults, then the config file (`explicit`, else the first existing search path),
/// then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/keypod/config.toml"));
    }
    out.push(PathBuf::from("/etc/keypod/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "config loaded");
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
        let value = value?;
        match value.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %value, "ignoring unparsable environment override");
                None
            }
        }
    }
    if let Some(v) = var("KEYPOD_NAME") {
        c.name = v;
    }
    if let Some(v) = var("KEYPOD_HOST") {
        c.advertised_host = Some(v).filter(|h| !h.is_empty());
    }
    if let Some(p) = parsed("KEYPOD_DISCOVERY_PORT", var("KEYPOD_DISCOVERY_PORT")) {
        c.discovery_port = p;
    }
    if let Some(p) = parsed("KEYPOD_TRANSPORT_PORT", var("KEYPOD_TRANSPORT_PORT")) {
        c.transport_port = p;
    }
    if let Some(v) = var("KEYPOD_DATA_DIR") {
        c.data_dir = PathBuf::from(v);
    }
    if let Some(v) = var("KEYPOD_CURVE") {
        c.curve = v;
    }
    if let Some(n) = parsed("KEYPOD_POOL_CAPACITY", var("KEYPOD_POOL_CAPACITY")) {
        c.pool_capacity = n;
    }
    if let Some(b) = parsed("KEYPOD_AUTO_PAIR", var("KEYPOD_AUTO_PAIR")) {
        c.auto_pair = b;
    }
}
