use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{Repository, Session};

const SNMP_TIMEOUT_RANGE: RangeInclusive<u64> = 1..=60;
const SNMP_RETRIES_RANGE: RangeInclusive<u32> = 0..=10;
const POLLING_INTERVAL_RANGE: RangeInclusive<u64> = 10..=3600;
const CONCURRENCY_RANGE: RangeInclusive<usize> = 1..=100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub snmp_community: String,
    pub snmp_timeout_secs: u64,
    pub snmp_retries: u32,
    pub polling_interval_secs: u64,
    pub discovery_concurrency: usize,
    pub polling_concurrency: usize,
    pub discovery_network: Option<Ipv4Addr>,
    pub discovery_prefix: Option<u8>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            snmp_community: "public".to_string(),
            snmp_timeout_secs: 10,
            snmp_retries: 3,
            polling_interval_secs: 60,
            discovery_concurrency: 20,
            polling_concurrency: 20,
            discovery_network: None,
            discovery_prefix: None,
        }
    }
}

impl Settings {
    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_secs(self.snmp_timeout_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    /// Layers a persisted override on top of these defaults. Override
    /// values outside their allowed range are ignored.
    pub fn with_override(&self, layer: &SettingsOverride) -> Settings {
        let mut merged = self.clone();

        if let Some(community) = layer.snmp_community.as_ref().filter(|c| !c.is_empty()) {
            merged.snmp_community = community.clone();
        }
        if let Some(v) = accept("snmp_timeout_secs", layer.snmp_timeout_secs, &SNMP_TIMEOUT_RANGE) {
            merged.snmp_timeout_secs = v;
        }
        if let Some(v) = accept("snmp_retries", layer.snmp_retries, &SNMP_RETRIES_RANGE) {
            merged.snmp_retries = v;
        }
        if let Some(v) = accept(
            "polling_interval_secs",
            layer.polling_interval_secs,
            &POLLING_INTERVAL_RANGE,
        ) {
            merged.polling_interval_secs = v;
        }
        if let Some(v) = accept(
            "discovery_concurrency",
            layer.discovery_concurrency,
            &CONCURRENCY_RANGE,
        ) {
            merged.discovery_concurrency = v;
        }
        if let Some(v) = accept("polling_concurrency", layer.polling_concurrency, &CONCURRENCY_RANGE) {
            merged.polling_concurrency = v;
        }
        if let Some(network) = layer.discovery_network {
            merged.discovery_network = Some(network);
        }
        if let Some(v) = accept("discovery_prefix", layer.discovery_prefix, &(0..=32)) {
            merged.discovery_prefix = Some(v);
        }

        merged
    }
}

fn accept<T>(field: &str, value: Option<T>, range: &RangeInclusive<T>) -> Option<T>
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    let value = value?;
    if range.contains(&value) {
        Some(value)
    } else {
        warn!(field, %value, "ignoring out-of-range settings override");
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverride {
    pub snmp_community: Option<String>,
    pub snmp_timeout_secs: Option<u64>,
    pub snmp_retries: Option<u32>,
    pub polling_interval_secs: Option<u64>,
    pub discovery_concurrency: Option<usize>,
    pub polling_concurrency: Option<usize>,
    pub discovery_network: Option<Ipv4Addr>,
    pub discovery_prefix: Option<u8>,
}

impl SettingsOverride {
    pub fn merge(&mut self, other: SettingsOverride) {
        if other.snmp_community.is_some() {
            self.snmp_community = other.snmp_community;
        }
        if other.snmp_timeout_secs.is_some() {
            self.snmp_timeout_secs = other.snmp_timeout_secs;
        }
        if other.snmp_retries.is_some() {
            self.snmp_retries = other.snmp_retries;
        }
        if other.polling_interval_secs.is_some() {
            self.polling_interval_secs = other.polling_interval_secs;
        }
        if other.discovery_concurrency.is_some() {
            self.discovery_concurrency = other.discovery_concurrency;
        }
        if other.polling_concurrency.is_some() {
            self.polling_concurrency = other.polling_concurrency;
        }
        if other.discovery_network.is_some() {
            self.discovery_network = other.discovery_network;
        }
        if other.discovery_prefix.is_some() {
            self.discovery_prefix = other.discovery_prefix;
        }
    }
}

pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Settings;
}

#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub Settings);

impl ConfigProvider for StaticConfig {
    fn snapshot(&self) -> Settings {
        self.0.clone()
    }
}

pub struct StoreConfig<R: Repository> {
    defaults: Settings,
    repo: Arc<R>,
}

impl<R: Repository> StoreConfig<R> {
    pub fn new(defaults: Settings, repo: Arc<R>) -> Self {
        Self { defaults, repo }
    }
}

impl<R: Repository> ConfigProvider for StoreConfig<R> {
    fn snapshot(&self) -> Settings {
        let layer = self
            .repo
            .begin()
            .and_then(|session| session.load_settings_override());

        match layer {
            Ok(layer) => self.defaults.with_override(&layer),
            Err(err) => {
                warn!(error = %err, "failed to read settings override, using defaults");
                self.defaults.clone()
            }
        }
    }
}
