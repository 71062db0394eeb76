use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Daemon configuration, loaded from a JSON file.
///
/// Anything not given in the file falls back to defaults chosen to match
/// a stand-alone client/server deployment (port 123, no local reference,
/// no persisted state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_ntp_port")]
    pub ntp_port: u16,

    /// Address to bind the IPv4 server socket to.
    #[serde(default = "default_bind4")]
    pub bind_address4: Ipv4Addr,

    /// Address to bind the IPv6 server socket to, if IPv6 is wanted.
    #[serde(default)]
    pub bind_address6: Option<Ipv6Addr>,

    /// Updates with an estimated skew above this (in ppm) are discarded
    /// as too unreliable to steer the clock.
    #[serde(default = "default_max_update_skew")]
    pub max_update_skew_ppm: f64,

    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_statistics: bool,

    #[serde(default)]
    pub log_tracking: bool,

    #[serde(default)]
    pub log_measurements: bool,

    /// Serve time at this stratum when no remote source is selectable.
    #[serde(default)]
    pub local_stratum: Option<u8>,

    /// Seconds without a selectable reference before the daemon reports
    /// itself unsynchronised.
    #[serde(default = "default_sync_grace")]
    pub sync_grace: f64,

    #[serde(default)]
    pub drift_file: Option<PathBuf>,

    #[serde(default)]
    pub dump_dir: Option<PathBuf>,

    /// Kernel HZ override for the tick-based clock driver.
    #[serde(default)]
    pub linux_hz: Option<i64>,

    /// Kernel frequency scaling factor override (units per ppm).
    #[serde(default)]
    pub linux_freq_scale: Option<f64>,

    /// Symmetric keys for packet authentication, indexed by key id.
    /// Values are hex-encoded key material.
    #[serde(default)]
    pub keys: std::collections::HashMap<u32, String>,

    /// Path of the local command socket.
    #[serde(default)]
    pub command_socket: Option<PathBuf>,

    /// Password required before privileged command verbs are accepted.
    #[serde(default)]
    pub command_password: Option<String>,

    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

fn default_ntp_port() -> u16 {
    123
}
fn default_bind4() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_max_update_skew() -> f64 {
    1000.0
}
fn default_max_samples() -> usize {
    crate::sourcestats::MAX_SAMPLES
}
fn default_min_samples() -> usize {
    3
}
fn default_sync_grace() -> f64 {
    300.0
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ntp_port: default_ntp_port(),
            bind_address4: default_bind4(),
            bind_address6: None,
            max_update_skew_ppm: default_max_update_skew(),
            max_samples: default_max_samples(),
            min_samples: default_min_samples(),
            log_dir: None,
            log_statistics: false,
            log_tracking: false,
            log_measurements: false,
            local_stratum: None,
            sync_grace: default_sync_grace(),
            drift_file: None,
            dump_dir: None,
            linux_hz: None,
            linux_freq_scale: None,
            keys: std::collections::HashMap::new(),
            command_socket: None,
            command_password: None,
            sources: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn bind_address(&self, v6: bool) -> Option<IpAddr> {
        if v6 {
            self.bind_address6.map(IpAddr::V6)
        } else {
            Some(IpAddr::V4(self.bind_address4))
        }
    }

    /// Decoded key material for a key id, or None if unknown or malformed.
    pub fn key_material(&self, id: u32) -> Option<Vec<u8>> {
        let hex = self.keys.get(&id)?;
        if hex.len() % 2 != 0 {
            return None;
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect()
    }
}

/// How a remote source participates in reference selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectOption {
    #[default]
    Normal,
    /// Preferred over other truechimers with equal root distance.
    Prefer,
    /// Polled for statistics but never chosen as the reference.
    Noselect,
}

/// NTP association type of a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Server,
    Peer,
}

/// One `server`/`peer` line: a name (or literal address) plus options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub source_type: SourceType,
    #[serde(default = "default_ntp_port")]
    pub port: u16,
    #[serde(flatten)]
    pub options: SourceOptions,
}

/// Per-source tunables. Field names match the configuration keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOptions {
    #[serde(default = "default_minpoll")]
    pub minpoll: i8,
    #[serde(default = "default_maxpoll")]
    pub maxpoll: i8,
    /// Send a warm-up packet before the real poll once the polling
    /// interval reaches this value.
    #[serde(default)]
    pub presend: Option<i8>,
    #[serde(default = "default_maxdelay")]
    pub maxdelay: f64,
    #[serde(default)]
    pub maxdelayratio: f64,
    #[serde(default = "default_maxdelaydevratio")]
    pub maxdelaydevratio: f64,
    #[serde(default)]
    pub key: Option<u32>,
    #[serde(default)]
    pub offline: bool,
    /// Take the source offline automatically when the network goes away.
    #[serde(default)]
    pub auto_offline: bool,
    #[serde(default)]
    pub iburst: bool,
    #[serde(default)]
    pub minstratum: u8,
    #[serde(default = "default_polltarget")]
    pub polltarget: u32,
    #[serde(default)]
    pub noselect: bool,
    #[serde(default)]
    pub prefer: bool,
}

fn default_minpoll() -> i8 {
    6
}
fn default_maxpoll() -> i8 {
    10
}
fn default_maxdelay() -> f64 {
    16.0
}
fn default_maxdelaydevratio() -> f64 {
    10.0
}
fn default_polltarget() -> u32 {
    8
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            minpoll: default_minpoll(),
            maxpoll: default_maxpoll(),
            presend: None,
            maxdelay: default_maxdelay(),
            maxdelayratio: 0.0,
            maxdelaydevratio: default_maxdelaydevratio(),
            key: None,
            offline: false,
            auto_offline: false,
            iburst: false,
            minstratum: 0,
            polltarget: default_polltarget(),
            noselect: false,
            prefer: false,
        }
    }
}

impl SourceOptions {
    pub fn select_option(&self) -> SelectOption {
        if self.noselect {
            SelectOption::Noselect
        } else if self.prefer {
            SelectOption::Prefer
        } else {
            SelectOption::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.ntp_port, 123);
        assert_eq!(cfg.max_update_skew_ppm, 1000.0);
        assert_eq!(cfg.max_samples, 64);
        assert!(cfg.sources.is_empty());
        assert!(cfg.local_stratum.is_none());
    }

    #[test]
    fn test_source_option_keywords() {
        let json = r#"{
            "name": "ntp.example.net",
            "type": "server",
            "minpoll": 4,
            "maxpoll": 8,
            "maxdelaydevratio": 2.0,
            "iburst": true,
            "prefer": true,
            "polltarget": 6
        }"#;
        let spec: SourceSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.port, 123);
        assert_eq!(spec.options.minpoll, 4);
        assert_eq!(spec.options.maxpoll, 8);
        assert!(spec.options.iburst);
        assert_eq!(spec.options.polltarget, 6);
        assert_eq!(spec.options.select_option(), SelectOption::Prefer);
    }

    #[test]
    fn test_noselect_beats_prefer() {
        let opts = SourceOptions {
            noselect: true,
            prefer: true,
            ..SourceOptions::default()
        };
        assert_eq!(opts.select_option(), SelectOption::Noselect);
    }

    #[test]
    fn test_key_material_decoding() {
        let mut cfg = Config::default();
        cfg.keys.insert(1, "00ffa5".to_string());
        cfg.keys.insert(2, "0g".to_string());
        assert_eq!(cfg.key_material(1), Some(vec![0x00, 0xff, 0xa5]));
        assert_eq!(cfg.key_material(2), None);
        assert_eq!(cfg.key_material(3), None);
    }
}
