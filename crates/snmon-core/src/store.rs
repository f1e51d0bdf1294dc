use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::config::SettingsOverride;
use crate::model::{
    AlertId, AlertKind, AlertRecord, Device, DeviceId, DeviceMetric, DiscoveredDevice, Interface,
    InterfaceId, InterfaceMetric, NewAlertRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is busy")]
    Busy,
    #[error("{0} not found")]
    NotFound(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hands out isolated sessions. Every concurrent unit of work begins its
/// own; sessions are never shared between tasks.
pub trait Repository: Send + Sync + 'static {
    type Session: Session + Send;

    fn begin(&self) -> Result<Self::Session, StoreError>;
}

/// A unit of work over the store. Writes are staged until `commit`;
/// dropping a session without committing discards them.
pub trait Session {
    fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError>;
    fn get_device_by_address(&self, address: Ipv4Addr) -> Result<Option<Device>, StoreError>;
    fn list_device_ids(&self) -> Result<Vec<DeviceId>, StoreError>;
    fn list_devices(&self) -> Result<Vec<Device>, StoreError>;
    /// Matches by MAC when one is known, otherwise by address. Returns the
    /// stored device and whether it was newly created.
    fn upsert_device_by_mac(&mut self, found: &DiscoveredDevice) -> Result<(Device, bool), StoreError>;
    fn save_device(&mut self, device: &Device) -> Result<(), StoreError>;
    fn delete_device(&mut self, id: DeviceId) -> Result<(), StoreError>;

    fn list_interfaces(&self, device: DeviceId) -> Result<Vec<Interface>, StoreError>;
    fn get_interface(&self, device: DeviceId, if_index: u32) -> Result<Option<Interface>, StoreError>;
    fn get_or_create_interface(
        &mut self,
        device: DeviceId,
        if_index: u32,
        name: &str,
    ) -> Result<(Interface, bool), StoreError>;
    fn save_interface(&mut self, interface: &Interface) -> Result<(), StoreError>;

    fn append_device_metric(&mut self, metric: DeviceMetric) -> Result<(), StoreError>;
    fn append_interface_metric(&mut self, metric: InterfaceMetric) -> Result<(), StoreError>;
    /// Up to `limit` samples, newest first.
    fn recent_device_metrics(&self, device: DeviceId, limit: usize) -> Result<Vec<DeviceMetric>, StoreError>;
    /// Up to `limit` samples, newest first.
    fn recent_interface_metrics(
        &self,
        interface: InterfaceId,
        limit: usize,
    ) -> Result<Vec<InterfaceMetric>, StoreError>;

    fn list_recipients(&self) -> Result<Vec<String>, StoreError>;
    fn add_recipient(&mut self, email: &str) -> Result<bool, StoreError>;
    fn remove_recipient(&mut self, email: &str) -> Result<bool, StoreError>;

    fn insert_alert_record(&mut self, record: NewAlertRecord) -> Result<AlertRecord, StoreError>;
    fn get_alert_record(&self, id: AlertId) -> Result<Option<AlertRecord>, StoreError>;
    fn save_alert_record(&mut self, record: &AlertRecord) -> Result<(), StoreError>;
    fn find_open_alert_record(
        &self,
        kind: AlertKind,
        device: DeviceId,
        interface: Option<InterfaceId>,
    ) -> Result<Option<AlertRecord>, StoreError>;
    fn close_alert_record(&mut self, id: AlertId, at: DateTime<Utc>) -> Result<(), StoreError>;
    fn list_alert_records(&self, device: Option<DeviceId>) -> Result<Vec<AlertRecord>, StoreError>;

    fn load_settings_override(&self) -> Result<SettingsOverride, StoreError>;
    fn save_settings_override(&mut self, layer: &SettingsOverride) -> Result<(), StoreError>;

    /// Publishes staged writes. On `Busy` the staged writes are kept so the
    /// commit can be retried.
    fn commit(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(20),
        }
    }
}

pub async fn retry_busy<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match op() {
            Err(StoreError::Busy) if attempt < policy.attempts => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "store busy, backing off");
                sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub async fn commit_with_retry<S>(session: &mut S, policy: &RetryPolicy) -> Result<(), StoreError>
where
    S: Session + ?Sized,
{
    retry_busy(policy, || session.commit()).await
}
