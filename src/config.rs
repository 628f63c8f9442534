use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Firewall configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Per-state idle timeouts for tracked flows, plus the sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Timeout for half-open flows (SYN_SENT / SYN_RECV)
    pub syn_timeout_secs: u64,
    /// Timeout for established flows
    pub established_timeout_secs: u64,
    /// Timeout for flows in teardown (FIN_WAIT* / CLOSE_WAIT / LAST_ACK)
    pub fin_timeout_secs: u64,
    /// Timeout for TIME_WAIT flows
    pub time_wait_timeout_secs: u64,
    /// How often the background sweep runs
    pub sweep_interval_secs: u64,
}

/// SYN/RST flood control knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    /// Max initial SYNs per source IP per window
    pub syn_per_ip_limit: u32,
    /// SYN counting window
    pub syn_window_ms: u64,
    /// Max RSTs per source IP per window
    pub rst_per_ip_limit: u32,
    /// RST counting window
    pub rst_window_ms: u64,
    /// Cap on SYN_SENT + SYN_RECV entries across the whole table
    pub global_half_open_limit: u32,
    /// How long an offending source stays shunned
    pub ban_duration_secs: u64,
}

/// NFQUEUE binding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Netfilter queue number to bind
    pub queue_num: u16,
    /// Copy range for queued packets
    pub max_packet_len: u16,
    /// Kernel-side queue length
    pub max_queue_len: u32,
}

/// Monitoring HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Address the monitor server binds to
    pub bind_addr: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            syn_timeout_secs: 30,
            established_timeout_secs: 300,
            fin_timeout_secs: 60,
            time_wait_timeout_secs: 30,
            sweep_interval_secs: 5,
        }
    }
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            syn_per_ip_limit: 50,
            syn_window_ms: 1000,
            rst_per_ip_limit: 50,
            rst_window_ms: 1000,
            global_half_open_limit: 2000,
            ban_duration_secs: 90,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_num: 0,
            max_packet_len: 65535,
            max_queue_len: 255,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl TableConfig {
    pub fn syn_timeout(&self) -> Duration {
        Duration::from_secs(self.syn_timeout_secs)
    }

    pub fn established_timeout(&self) -> Duration {
        Duration::from_secs(self.established_timeout_secs)
    }

    pub fn fin_timeout(&self) -> Duration {
        Duration::from_secs(self.fin_timeout_secs)
    }

    pub fn time_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.time_wait_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl FloodConfig {
    pub fn syn_window(&self) -> Duration {
        Duration::from_millis(self.syn_window_ms)
    }

    pub fn rst_window(&self) -> Duration {
        Duration::from_millis(self.rst_window_ms)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    /// SYN count at which the source gets shunned outright.
    pub fn ban_trigger(&self) -> u32 {
        self.syn_per_ip_limit.saturating_mul(4)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.flood.syn_per_ip_limit == 0 {
            anyhow::bail!("Invalid syn_per_ip_limit: must be > 0");
        }
        if self.flood.rst_per_ip_limit == 0 {
            anyhow::bail!("Invalid rst_per_ip_limit: must be > 0");
        }
        if self.flood.syn_window_ms == 0 || self.flood.rst_window_ms == 0 {
            anyhow::bail!("Invalid counter window: must be > 0 ms");
        }
        if self.table.sweep_interval_secs == 0 {
            anyhow::bail!("Invalid sweep_interval_secs: must be > 0");
        }
        if self.queue.max_queue_len == 0 {
            anyhow::bail!("Invalid max_queue_len: must be > 0");
        }
        if self.monitor.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("Invalid monitor bind_addr: {}", self.monitor.bind_addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.table.syn_timeout_secs, 30);
        assert_eq!(config.table.established_timeout_secs, 300);
        assert_eq!(config.flood.syn_per_ip_limit, 50);
        assert_eq!(config.flood.global_half_open_limit, 2000);
        assert_eq!(config.queue.queue_num, 0);
        assert_eq!(config.monitor.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_ban_trigger_is_four_times_syn_limit() {
        let flood = FloodConfig::default();
        assert_eq!(flood.ban_trigger(), 200);
    }

    #[test]
    fn test_config_validation_succeeds() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_fails_zero_limit() {
        let mut config = Config::default();
        config.flood.syn_per_ip_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_fails_bad_bind_addr() {
        let mut config = Config::default();
        config.monitor.bind_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization_partial() {
        let toml_str = r#"
            [flood]
            syn_per_ip_limit = 10
            syn_window_ms = 500
            rst_per_ip_limit = 10
            rst_window_ms = 500
            global_half_open_limit = 100
            ban_duration_secs = 30
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.flood.syn_per_ip_limit, 10);
        assert_eq!(config.flood.ban_trigger(), 40);
        // Untouched sections fall back to defaults
        assert_eq!(config.table.syn_timeout_secs, 30);
    }

    #[test]
    fn test_config_round_trip() {
        let original = Config::default();
        let toml_str = toml::to_string(&original).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(
            original.flood.syn_per_ip_limit,
            deserialized.flood.syn_per_ip_limit
        );
        assert_eq!(original.queue.queue_num, deserialized.queue.queue_num);
    }
}
