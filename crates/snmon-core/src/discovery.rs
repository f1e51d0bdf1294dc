use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ConfigProvider;
use crate::model::{Device, DiscoveredDevice};
use crate::oids::{Vendor, DISCOVERY_OIDS};
use crate::snmp::{SnmpClient, SnmpTarget, SnmpValue};
use crate::store::{commit_with_retry, Repository, RetryPolicy, Session, StoreError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid network {network}/{prefix}: {reason}")]
    InvalidNetwork {
        network: Ipv4Addr,
        prefix: u8,
        reason: String,
    },
    #[error("no discovery network configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySummary {
    pub total_scanned: usize,
    pub devices_found: usize,
    pub devices: Vec<Device>,
}

/// Usable host addresses of a block. Network and broadcast addresses are
/// left out except for /31 and /32, which have none to spare.
pub fn host_addresses(network: Ipv4Addr, prefix: u8) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let invalid = |reason: String| DiscoveryError::InvalidNetwork {
        network,
        prefix,
        reason,
    };
    let block = Ipv4Network::new(network, prefix).map_err(|e| invalid(e.to_string()))?;
    let block = Ipv4Network::new(block.network(), prefix).map_err(|e| invalid(e.to_string()))?;

    let hosts = match prefix {
        32 | 31 => block.iter().collect(),
        _ => block
            .iter()
            .filter(|ip| *ip != block.network() && *ip != block.broadcast())
            .collect(),
    };
    Ok(hosts)
}

fn parse_probe(host: Ipv4Addr, values: &[SnmpValue]) -> DiscoveredDevice {
    let value = |i: usize| values.get(i).unwrap_or(&SnmpValue::Missing);

    DiscoveredDevice {
        address: host,
        hostname: value(0).as_text().unwrap_or_else(|| host.to_string()),
        mac_address: value(1).as_mac().unwrap_or_default(),
        vendor: value(2)
            .as_text()
            .map(|oid| Vendor::from_sys_object_id(&oid))
            .unwrap_or_default(),
    }
}

pub struct Discovery<R: Repository> {
    client: Arc<dyn SnmpClient>,
    repo: Arc<R>,
    config: Arc<dyn ConfigProvider>,
    retry: RetryPolicy,
}

impl<R: Repository> Discovery<R> {
    pub fn new(client: Arc<dyn SnmpClient>, repo: Arc<R>, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            client,
            repo,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn scan_configured(&self) -> Result<DiscoverySummary, DiscoveryError> {
        let settings = self.config.snapshot();
        match (settings.discovery_network, settings.discovery_prefix) {
            (Some(network), Some(prefix)) => self.scan(network, prefix).await,
            _ => Err(DiscoveryError::NotConfigured),
        }
    }

    pub async fn scan(&self, network: Ipv4Addr, prefix: u8) -> Result<DiscoverySummary, DiscoveryError> {
        let settings = self.config.snapshot();
        let hosts = host_addresses(network, prefix)?;
        info!(%network, prefix, hosts = hosts.len(), concurrency = settings.discovery_concurrency, "discovery scan started");

        let gate = Arc::new(Semaphore::new(settings.discovery_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for host in hosts.iter().copied() {
            let gate = Arc::clone(&gate);
            let client = Arc::clone(&self.client);
            let repo = Arc::clone(&self.repo);
            let target = SnmpTarget::new(host, &settings);
            let retry = self.retry;

            tasks.spawn(async move {
                let _permit = gate.acquire_owned().await.ok()?;
                match probe(client.as_ref(), repo.as_ref(), &target, &retry).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(host = %host, error = %err, "discovery probe failed");
                        None
                    }
                }
            });
        }

        let mut devices = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "discovery task aborted"),
            }
        }
        devices.sort_by_key(|d: &Device| d.address);

        info!(
            %network,
            prefix,
            scanned = hosts.len(),
            found = devices.len(),
            "discovery scan complete"
        );
        Ok(DiscoverySummary {
            total_scanned: hosts.len(),
            devices_found: devices.len(),
            devices,
        })
    }
}

async fn probe<R: Repository>(
    client: &dyn SnmpClient,
    repo: &R,
    target: &SnmpTarget,
    retry: &RetryPolicy,
) -> Result<Option<Device>, StoreError> {
    let values = match client.get(target, &DISCOVERY_OIDS).await {
        Ok(values) => values,
        Err(err) => {
            debug!(host = %target.host, error = %err, "no snmp agent");
            return Ok(None);
        }
    };
    let found = parse_probe(target.host, &values);

    let mut session = repo.begin()?;
    let (device, created) = session.upsert_device_by_mac(&found)?;
    commit_with_retry(&mut session, retry).await?;

    info!(
        host = %device.address,
        hostname = %device.hostname,
        mac = %device.mac_address,
        vendor = device.vendor.label(),
        created,
        "device discovered"
    );
    Ok(Some(device))
}
