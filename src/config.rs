use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use log::LevelFilter;
use mac_address::MacAddress;
use serde::Deserializer;
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default, deserialize_with = "level_filter")]
    pub log_level: Option<LevelFilter>,
    pub pins: PinConfig,
    pub buttons: Option<ButtonConfig>,
    pub cover: Option<CoverConfig>,
    pub remote: Option<RemoteConfig>,
    pub proximity: Option<ProximityConfig>,
    pub scan: Option<ScanConfig>,
}

/// BCM line numbers.
#[derive(Deserialize, Debug, Clone)]
pub struct PinConfig {
    pub outdoor_button: u8,
    pub indoor_button: Option<u8>,
    pub lock_button: Option<u8>,
    pub cover_led: u8,
    pub lock_led: Option<u8>,
    pub tracking_led: Option<u8>,
    pub run_led: Option<u8>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ButtonConfig {
    pub debounce_ms: Option<u64>,
    pub queue_depth: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoverPolicy {
    /// Read the live state from the remote service on every press
    #[default]
    Remote,
    /// Mirror the indicator locally, gate opening on proximity
    Local,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct CoverConfig {
    pub policy: Option<CoverPolicy>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub token: String,
    pub entity_id: String,
    pub service_domain: Option<String>,
    pub on_state: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl RemoteConfig {
    pub fn service_domain(&self) -> &str {
        self.service_domain.as_deref().unwrap_or("input_boolean")
    }

    pub fn on_state(&self) -> &str {
        self.on_state.as_deref().unwrap_or("on")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(10))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub enum Manufacturer {
    Apple,
    Google,
}

impl Manufacturer {
    /// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
    pub fn company_ids(&self) -> Vec<u16> {
        match self {
            Manufacturer::Apple => vec![0x004C],
            Manufacturer::Google => vec![0x018E, 0x00E0],
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Drive the tracking state machine
    #[default]
    Track,
    /// Log qualifying devices only
    Discovery,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ProximityConfig {
    pub mode: Option<ScanMode>,
    pub manufacturer: Option<Manufacturer>,
    pub address: Option<MacAddress>,
    pub rssi_floor: Option<i16>,
    pub timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub duration_ms: Option<u64>,
    pub interval_us: Option<u32>,
    pub window_us: Option<u32>,
    pub active: Option<bool>,
    pub yield_ms: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cover_policy() == CoverPolicy::Remote && self.remote.is_none() {
            bail!("cover policy \"remote\" needs a [remote] section");
        }
        let buttons = self.buttons.clone().unwrap_or_default();
        if buttons.queue_depth == Some(0) {
            bail!("buttons.queue_depth must be at least 1");
        }
        let scan = self.scan.clone().unwrap_or_default();
        let duration_ms = scan.duration_ms.unwrap_or(DEFAULT_SCAN_DURATION_MS);
        let yield_ms = scan.yield_ms.unwrap_or(DEFAULT_SCAN_YIELD_MS);
        if yield_ms == 0 || yield_ms >= duration_ms {
            bail!("scan.yield_ms must be at least 1 and below scan.duration_ms ({duration_ms})");
        }
        let interval_us = scan.interval_us.unwrap_or(DEFAULT_SCAN_INTERVAL_US);
        if scan.window_us.unwrap_or(DEFAULT_SCAN_WINDOW_US) > interval_us {
            bail!("scan.window_us must not exceed scan.interval_us");
        }
        Ok(())
    }

    pub fn cover_policy(&self) -> CoverPolicy {
        self.cover
            .as_ref()
            .and_then(|c| c.policy)
            .unwrap_or_default()
    }
}

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_QUEUE_DEPTH: usize = 8;
pub const DEFAULT_RSSI_FLOOR: i16 = -35;
pub const DEFAULT_TRACKING_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_SCAN_DURATION_MS: u64 = 1000;
pub const DEFAULT_SCAN_INTERVAL_US: u32 = 30_000;
pub const DEFAULT_SCAN_WINDOW_US: u32 = 30_000;
pub const DEFAULT_SCAN_YIELD_MS: u64 = 100;

fn level_filter<'de, D>(deserializer: D) -> Result<Option<LevelFilter>, D::Error>
where
    D: Deserializer<'de>,
{
    let level: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    level
        .map(|l| LevelFilter::from_str(&l).map_err(serde::de::Error::custom))
        .transpose()
}
