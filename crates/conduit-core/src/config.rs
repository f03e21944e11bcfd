//! conduit.toml configuration parser.
//!
//! The file is re-read at the start of every loop cycle through
//! [`ConfigSource`]; a broken edit never stops monitoring, the last good
//! configuration stays in effect until the file is fixed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::worker::WorkerHandle;

/// Largest fleet a single host is expected to run.
pub const MAX_FLEET_SIZE: u32 = 64;

/// Upper bound for concurrent status queries.
pub const MAX_IN_FLIGHT: usize = 64;

const DAY_SECS: u64 = 86_400;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub fleet: FleetSection,
    pub tracker: TrackerSection,
    pub watchdog: WatchdogSection,
    pub notify: NotifySection,
    pub state: StateSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetSection {
    /// Number of worker containers.
    pub size: u32,
    /// Container name of the first worker; later ones get `-2`, `-3`, ...
    pub container_prefix: String,
    /// Container runtime CLI.
    pub docker_binary: String,
    /// Budget for a single worker status query.
    pub query_timeout: String,
    /// Ceiling on simultaneous status queries.
    pub max_in_flight: usize,
    /// Status collection cadence.
    pub status_interval: String,
    /// Log lines fetched per status query.
    pub log_tail_lines: u32,
    /// Ports the workers accept peers on (capture filter).
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerSection {
    pub enabled: bool,
    /// Capture interface passed to tcpdump (`any` for all).
    pub interface: String,
    pub tcpdump_binary: String,
    /// Length of one capture window; counters are persisted after each.
    pub capture_window: String,
    /// Peers idle longer than this drop out of the live peer table.
    pub peer_timeout: String,
    /// Extra addresses treated as local besides the host's interfaces.
    pub local_addrs: Vec<String>,
    pub geoip_command: String,
    pub geoip6_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogSection {
    pub probe_interval: String,
    pub probe_timeout: String,
    /// Consecutive failures before a target is declared down.
    pub failure_threshold: u32,
    /// Minimum spacing between two restarts of the same target.
    pub restart_cooldown: String,
    /// systemd unit of the container runtime; empty disables the probe.
    pub container_runtime_unit: String,
    pub reverse_proxy: Option<ReverseProxySection>,
    pub cpu_threshold_percent: f32,
    pub memory_threshold_percent: f32,
    pub alert_on_recovery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReverseProxySection {
    pub unit: String,
    /// `host:port` of the proxy's health endpoint.
    pub address: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifySection {
    pub tick_interval: String,
    pub periodic_interval: String,
    /// Time of day (UTC) of the first periodic slot, e.g. `"8h"`.
    pub periodic_phase: String,
    /// How long after a slot a periodic report may still go out.
    pub periodic_window: String,
    pub daily: bool,
    pub weekly: bool,
    /// Countries listed in reports.
    pub top_countries: usize,
    pub channel: ChannelConfig,
}

/// Where alerts and reports are delivered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Write messages to the log only.
    #[default]
    Log,
    Telegram { bot_token: String, chat_id: String },
    Webhook { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateSection {
    pub path: PathBuf,
}

fn default_health_path() -> String {
    "/".to_string()
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            size: 1,
            container_prefix: "conduit".to_string(),
            docker_binary: "docker".to_string(),
            query_timeout: "5s".to_string(),
            max_in_flight: 16,
            status_interval: "30s".to_string(),
            log_tail_lines: 50,
            ports: Vec::new(),
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: "any".to_string(),
            tcpdump_binary: "tcpdump".to_string(),
            capture_window: "15s".to_string(),
            peer_timeout: "45s".to_string(),
            local_addrs: Vec::new(),
            geoip_command: "geoiplookup".to_string(),
            geoip6_command: "geoiplookup6".to_string(),
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            probe_interval: "60s".to_string(),
            probe_timeout: "10s".to_string(),
            failure_threshold: 3,
            restart_cooldown: "5m".to_string(),
            container_runtime_unit: "docker".to_string(),
            reverse_proxy: None,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            alert_on_recovery: true,
        }
    }
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            tick_interval: "60s".to_string(),
            periodic_interval: "6h".to_string(),
            periodic_phase: "0h".to_string(),
            periodic_window: "30m".to_string(),
            daily: true,
            weekly: true,
            top_countries: 10,
            channel: ChannelConfig::Log,
        }
    }
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/conduit-fleet/state.redb"),
        }
    }
}

impl FleetConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let mut config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject hard errors and clamp soft-bounded values with a warning.
    pub fn validate(&mut self) -> ConfigResult<()> {
        if self.fleet.size > MAX_FLEET_SIZE {
            return Err(invalid(
                "fleet.size",
                format!("{} exceeds the maximum of {MAX_FLEET_SIZE}", self.fleet.size),
            ));
        }
        if self.fleet.container_prefix.trim().is_empty() {
            return Err(invalid("fleet.container_prefix", "must not be empty".into()));
        }
        require_positive("fleet.query_timeout", &self.fleet.query_timeout)?;
        require_positive("fleet.status_interval", &self.fleet.status_interval)?;
        require_positive("tracker.capture_window", &self.tracker.capture_window)?;
        require_positive("tracker.peer_timeout", &self.tracker.peer_timeout)?;
        require_positive("watchdog.probe_interval", &self.watchdog.probe_interval)?;
        require_positive("watchdog.probe_timeout", &self.watchdog.probe_timeout)?;
        require_duration("watchdog.restart_cooldown", &self.watchdog.restart_cooldown)?;
        require_positive("notify.tick_interval", &self.notify.tick_interval)?;
        require_duration("notify.periodic_window", &self.notify.periodic_window)?;

        if self.watchdog.failure_threshold == 0 {
            return Err(invalid("watchdog.failure_threshold", "must be at least 1".into()));
        }

        let interval = require_positive("notify.periodic_interval", &self.notify.periodic_interval)?;
        if interval.as_secs() < 60 {
            return Err(invalid(
                "notify.periodic_interval",
                "must be at least one minute".into(),
            ));
        }
        let phase = require_duration("notify.periodic_phase", &self.notify.periodic_phase)?;
        if phase.as_secs() >= DAY_SECS {
            return Err(invalid(
                "notify.periodic_phase",
                "must be a time of day below 24h".into(),
            ));
        }

        for addr in &self.tracker.local_addrs {
            if addr.parse::<std::net::IpAddr>().is_err() {
                return Err(invalid("tracker.local_addrs", format!("`{addr}` is not an IP address")));
            }
        }

        if let ChannelConfig::Telegram { bot_token, chat_id } = &self.notify.channel {
            if bot_token.is_empty() || chat_id.is_empty() {
                return Err(invalid(
                    "notify.channel",
                    "telegram needs bot_token and chat_id".into(),
                ));
            }
        }

        // Soft bounds.
        let clamped = self.fleet.max_in_flight.clamp(1, MAX_IN_FLIGHT);
        if clamped != self.fleet.max_in_flight {
            warn!(
                configured = self.fleet.max_in_flight,
                using = clamped,
                "fleet.max_in_flight out of range, clamping"
            );
            self.fleet.max_in_flight = clamped;
        }
        self.watchdog.cpu_threshold_percent =
            clamp_percent("watchdog.cpu_threshold_percent", self.watchdog.cpu_threshold_percent);
        self.watchdog.memory_threshold_percent = clamp_percent(
            "watchdog.memory_threshold_percent",
            self.watchdog.memory_threshold_percent,
        );
        if self.notify.top_countries == 0 {
            warn!("notify.top_countries is 0, using 1");
            self.notify.top_countries = 1;
        }

        Ok(())
    }

    /// Handles for every worker the fleet size calls for.
    pub fn worker_handles(&self) -> Vec<WorkerHandle> {
        (1..=self.fleet.size)
            .map(|index| WorkerHandle::numbered(&self.fleet.container_prefix, index))
            .collect()
    }

    /// Configured extra local addresses (validated at load).
    pub fn local_addrs(&self) -> Vec<std::net::IpAddr> {
        self.tracker
            .local_addrs
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect()
    }

    pub fn query_timeout(&self) -> Duration {
        duration_or(&self.fleet.query_timeout, Duration::from_secs(5))
    }

    pub fn status_interval(&self) -> Duration {
        duration_or(&self.fleet.status_interval, Duration::from_secs(30))
    }

    pub fn capture_window(&self) -> Duration {
        duration_or(&self.tracker.capture_window, Duration::from_secs(15))
    }

    pub fn peer_timeout(&self) -> Duration {
        duration_or(&self.tracker.peer_timeout, Duration::from_secs(45))
    }

    pub fn probe_interval(&self) -> Duration {
        duration_or(&self.watchdog.probe_interval, Duration::from_secs(60))
    }

    pub fn probe_timeout(&self) -> Duration {
        duration_or(&self.watchdog.probe_timeout, Duration::from_secs(10))
    }

    pub fn restart_cooldown(&self) -> Duration {
        duration_or(&self.watchdog.restart_cooldown, Duration::from_secs(300))
    }

    pub fn tick_interval(&self) -> Duration {
        duration_or(&self.notify.tick_interval, Duration::from_secs(60))
    }

    pub fn periodic_interval(&self) -> Duration {
        duration_or(&self.notify.periodic_interval, Duration::from_secs(6 * 3600))
    }

    pub fn periodic_phase(&self) -> Duration {
        duration_or(&self.notify.periodic_phase, Duration::ZERO)
    }

    pub fn periodic_window(&self) -> Duration {
        duration_or(&self.notify.periodic_window, Duration::from_secs(1800))
    }
}

/// Shared view of the config file that follows edits between cycles.
pub struct ConfigSource {
    path: PathBuf,
    last_good: RwLock<Arc<FleetConfig>>,
}

impl ConfigSource {
    /// Load the file once; errors here are fatal for the caller.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config = FleetConfig::from_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            last_good: RwLock::new(Arc::new(config)),
        })
    }

    /// A source that never re-reads (tests, one-shot commands).
    pub fn fixed(config: FleetConfig) -> Self {
        Self {
            path: PathBuf::new(),
            last_good: RwLock::new(Arc::new(config)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, falling back to the last good config on error.
    pub fn refresh(&self) -> Arc<FleetConfig> {
        if self.path.as_os_str().is_empty() {
            return self.current();
        }
        match FleetConfig::from_file(&self.path) {
            Ok(config) => {
                let config = Arc::new(config);
                if let Ok(mut guard) = self.last_good.write() {
                    if **guard != *config {
                        debug!(path = ?self.path, "configuration changed");
                    }
                    *guard = Arc::clone(&config);
                }
                config
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "config reload failed, keeping previous");
                self.current()
            }
        }
    }

    /// The last successfully loaded config.
    pub fn current(&self) -> Arc<FleetConfig> {
        match self.last_good.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

/// Parse a duration string like "500ms", "5s", "2m", "6h", "1d".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else if let Some(days) = s.strip_suffix('d') {
        days.trim().parse::<u64>().ok().map(|d| Duration::from_secs(d * DAY_SECS))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn duration_or(s: &str, fallback: Duration) -> Duration {
    parse_duration(s).unwrap_or(fallback)
}

fn require_duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| invalid(field, format!("`{value}` is not a duration")))
}

fn require_positive(field: &'static str, value: &str) -> ConfigResult<Duration> {
    let d = require_duration(field, value)?;
    if d.is_zero() {
        return Err(invalid(field, "must be greater than zero".into()));
    }
    Ok(d)
}

fn clamp_percent(field: &'static str, value: f32) -> f32 {
    let clamped = if value.is_nan() { 90.0 } else { value.clamp(1.0, 100.0) };
    if clamped != value {
        warn!(field, configured = value, using = clamped, "percentage out of range, clamping");
    }
    clamped
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = FleetConfig::from_toml("").unwrap();
        assert_eq!(config.fleet.size, 1);
        assert_eq!(config.query_timeout(), Duration::from_secs(5));
        assert_eq!(config.watchdog.failure_threshold, 3);
        assert_eq!(config.notify.channel, ChannelConfig::Log);
    }

    #[test]
    fn parse_full_file() {
        let toml_str = r#"
[fleet]
size = 3
container_prefix = "conduit"
query_timeout = "2s"
ports = [443, 8443]

[tracker]
capture_window = "10s"
local_addrs = ["203.0.113.7"]

[watchdog]
failure_threshold = 5
restart_cooldown = "10m"

[watchdog.reverse_proxy]
unit = "nginx"
address = "127.0.0.1:80"

[notify]
periodic_interval = "6h"
periodic_phase = "8h"

[notify.channel]
kind = "telegram"
bot_token = "123:abc"
chat_id = "42"
"#;
        let config = FleetConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.fleet.size, 3);
        assert_eq!(config.query_timeout(), Duration::from_secs(2));
        assert_eq!(config.restart_cooldown(), Duration::from_secs(600));
        assert_eq!(config.periodic_phase(), Duration::from_secs(8 * 3600));
        let proxy = config.watchdog.reverse_proxy.as_ref().unwrap();
        assert_eq!(proxy.health_path, "/");
        assert!(matches!(config.notify.channel, ChannelConfig::Telegram { .. }));
    }

    #[test]
    fn worker_handles_follow_fleet_size() {
        let mut config = FleetConfig::default();
        config.fleet.size = 3;
        let handles = config.worker_handles();
        let ids: Vec<&str> = handles.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["conduit", "conduit-2", "conduit-3"]);

        config.fleet.size = 0;
        assert!(config.worker_handles().is_empty());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = FleetConfig::from_toml("[watchdog]\nfailure_threshold = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "watchdog.failure_threshold", .. }
        ));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = FleetConfig::from_toml("[fleet]\nquery_timeout = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "fleet.query_timeout", .. }));
    }

    #[test]
    fn phase_must_be_within_a_day() {
        let err = FleetConfig::from_toml("[notify]\nperiodic_phase = \"24h\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "notify.periodic_phase", .. }));
    }

    #[test]
    fn oversized_fleet_is_rejected() {
        let err = FleetConfig::from_toml("[fleet]\nsize = 500\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "fleet.size", .. }));
    }

    #[test]
    fn soft_bounds_are_clamped() {
        let config = FleetConfig::from_toml(
            "[fleet]\nmax_in_flight = 0\n[watchdog]\ncpu_threshold_percent = 150.0\n",
        )
        .unwrap();
        assert_eq!(config.fleet.max_in_flight, 1);
        assert_eq!(config.watchdog.cpu_threshold_percent, 100.0);
    }

    #[test]
    fn telegram_without_token_is_rejected() {
        let toml_str = "[notify.channel]\nkind = \"telegram\"\nbot_token = \"\"\nchat_id = \"1\"\n";
        assert!(FleetConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn serialized_config_parses_back() {
        let config = FleetConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(FleetConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn source_keeps_last_good_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.toml");
        std::fs::write(&path, "[fleet]\nsize = 2\n").unwrap();

        let source = ConfigSource::load(&path).unwrap();
        assert_eq!(source.current().fleet.size, 2);

        std::fs::write(&path, "[fleet]\nsize = 4\n").unwrap();
        assert_eq!(source.refresh().fleet.size, 4);

        std::fs::write(&path, "[fleet\nsize = ").unwrap();
        assert_eq!(source.refresh().fleet.size, 4);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ConfigSource::load(Path::new("/nonexistent/conduit.toml")).err().unwrap();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("6h"), Some(Duration::from_secs(21_600)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }
}
