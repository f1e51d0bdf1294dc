use std::net::Ipv4Addr;

use tracing::debug;

pub const NETWORK_SUMMARY_KEY: &str = "network_summary";
pub const TOP_DEVICES_PREFIX: &str = "top_devices:";

pub fn device_key(address: Ipv4Addr) -> String {
    format!("device:{address}")
}

pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &str);
    fn invalidate_prefix(&self, prefix: &str);
}

/// Drops every aggregate that depends on the device's thresholds or
/// maintenance state.
pub fn invalidate_device(cache: &dyn CacheInvalidator, address: Ipv4Addr) {
    cache.invalidate(&device_key(address));
    cache.invalidate(NETWORK_SUMMARY_KEY);
    cache.invalidate_prefix(TOP_DEVICES_PREFIX);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn invalidate(&self, key: &str) {
        debug!(key, "cache invalidate");
    }

    fn invalidate_prefix(&self, prefix: &str) {
        debug!(prefix, "cache invalidate prefix");
    }
}
