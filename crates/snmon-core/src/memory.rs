use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use chrono::{DateTime, Utc};

use crate::config::SettingsOverride;
use crate::model::{
    AlertId, AlertKind, AlertRecord, Device, DeviceId, DeviceMetric, DiscoveredDevice, Interface,
    InterfaceId, InterfaceMetric, NewAlertRecord,
};
use crate::store::{Repository, Session, StoreError};

pub const DEFAULT_SAMPLES_PER_SERIES: usize = 1_000;

#[derive(Debug, Default)]
pub(crate) struct Tables {
    devices: BTreeMap<DeviceId, Device>,
    interfaces: BTreeMap<InterfaceId, Interface>,
    device_metrics: BTreeMap<DeviceId, VecDeque<DeviceMetric>>,
    interface_metrics: BTreeMap<InterfaceId, VecDeque<InterfaceMetric>>,
    recipients: Vec<String>,
    alert_records: BTreeMap<AlertId, AlertRecord>,
    settings: SettingsOverride,
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    next_id: AtomicI64,
    samples_per_series: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SAMPLES_PER_SERIES)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(samples_per_series: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                next_id: AtomicI64::new(1),
                samples_per_series: samples_per_series.max(1),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.shared.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Repository for MemoryStore {
    type Session = MemorySession;

    fn begin(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            shared: Arc::clone(&self.shared),
            staged: Staged::default(),
        })
    }
}

#[derive(Debug, Default)]
struct Staged {
    devices: BTreeMap<DeviceId, Device>,
    deleted_devices: BTreeSet<DeviceId>,
    interfaces: BTreeMap<InterfaceId, Interface>,
    device_metrics: Vec<DeviceMetric>,
    interface_metrics: Vec<InterfaceMetric>,
    recipients: Option<Vec<String>>,
    alert_records: BTreeMap<AlertId, AlertRecord>,
    settings: Option<SettingsOverride>,
}

#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    staged: Staged,
}

impl MemorySession {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.shared.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    fn next_id(&self) -> i64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn merged_devices(&self) -> Result<BTreeMap<DeviceId, Device>, StoreError> {
        let tables = self.tables()?;
        let mut devices = tables.devices.clone();
        drop(tables);

        for id in &self.staged.deleted_devices {
            devices.remove(id);
        }
        for (id, device) in &self.staged.devices {
            devices.insert(*id, device.clone());
        }
        Ok(devices)
    }

    fn merged_interfaces(&self, device: DeviceId) -> Result<BTreeMap<InterfaceId, Interface>, StoreError> {
        if self.staged.deleted_devices.contains(&device) {
            return Ok(BTreeMap::new());
        }
        let tables = self.tables()?;
        let mut interfaces: BTreeMap<_, _> = tables
            .interfaces
            .iter()
            .filter(|(_, i)| i.device_id == device)
            .map(|(id, i)| (*id, i.clone()))
            .collect();
        drop(tables);

        for (id, interface) in &self.staged.interfaces {
            if interface.device_id == device {
                interfaces.insert(*id, interface.clone());
            }
        }
        Ok(interfaces)
    }

    fn merged_records(&self) -> Result<BTreeMap<AlertId, AlertRecord>, StoreError> {
        let tables = self.tables()?;
        let mut records = tables.alert_records.clone();
        drop(tables);

        for (id, record) in &self.staged.alert_records {
            records.insert(*id, record.clone());
        }
        Ok(records)
    }

    fn check_unique(&self, tables: &Tables) -> Result<(), StoreError> {
        let mut merged = tables.devices.clone();
        for id in &self.staged.deleted_devices {
            merged.remove(id);
        }
        for (id, device) in &self.staged.devices {
            merged.insert(*id, device.clone());
        }

        let mut addresses = BTreeSet::new();
        let mut macs = BTreeSet::new();
        for device in merged.values() {
            if !addresses.insert(device.address) {
                return Err(StoreError::Constraint(format!(
                    "duplicate device address {}",
                    device.address
                )));
            }
            if !device.mac_address.is_empty() && !macs.insert(device.mac_address.as_str()) {
                return Err(StoreError::Constraint(format!(
                    "duplicate device mac {}",
                    device.mac_address
                )));
            }
        }
        Ok(())
    }
}

fn newest_first<T: Clone>(committed: Option<&VecDeque<T>>, staged: Vec<&T>, limit: usize) -> Vec<T> {
    let mut out: Vec<T> = staged.into_iter().rev().take(limit).cloned().collect();
    if let Some(series) = committed {
        let remaining = limit - out.len();
        out.extend(series.iter().rev().take(remaining).cloned());
    }
    out
}

fn push_capped<T>(series: &mut VecDeque<T>, sample: T, cap: usize) {
    series.push_back(sample);
    while series.len() > cap {
        series.pop_front();
    }
}

impl Session for MemorySession {
    fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        if self.staged.deleted_devices.contains(&id) {
            return Ok(None);
        }
        if let Some(device) = self.staged.devices.get(&id) {
            return Ok(Some(device.clone()));
        }
        Ok(self.tables()?.devices.get(&id).cloned())
    }

    fn get_device_by_address(&self, address: Ipv4Addr) -> Result<Option<Device>, StoreError> {
        Ok(self
            .merged_devices()?
            .into_values()
            .find(|d| d.address == address))
    }

    fn list_device_ids(&self) -> Result<Vec<DeviceId>, StoreError> {
        Ok(self.merged_devices()?.into_keys().collect())
    }

    fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.merged_devices()?.into_values().collect())
    }

    fn upsert_device_by_mac(&mut self, found: &DiscoveredDevice) -> Result<(Device, bool), StoreError> {
        let devices = self.merged_devices()?;
        let by_mac = (!found.mac_address.is_empty())
            .then(|| devices.values().find(|d| d.mac_address == found.mac_address))
            .flatten();
        let existing = by_mac.or_else(|| devices.values().find(|d| d.address == found.address));

        let (device, created) = match existing {
            Some(existing) => {
                let mut device = existing.clone();
                device.address = found.address;
                device.hostname = found.hostname.clone();
                if !found.mac_address.is_empty() {
                    device.mac_address = found.mac_address.clone();
                }
                device.vendor = found.vendor;
                (device, false)
            }
            None => (Device::new(self.next_id(), found), true),
        };

        self.staged.devices.insert(device.id, device.clone());
        Ok((device, created))
    }

    fn save_device(&mut self, device: &Device) -> Result<(), StoreError> {
        if self.get_device(device.id)?.is_none() {
            return Err(StoreError::NotFound(format!("device {}", device.id)));
        }
        self.staged.devices.insert(device.id, device.clone());
        Ok(())
    }

    fn delete_device(&mut self, id: DeviceId) -> Result<(), StoreError> {
        if self.get_device(id)?.is_none() {
            return Err(StoreError::NotFound(format!("device {id}")));
        }
        self.staged.devices.remove(&id);
        self.staged.interfaces.retain(|_, i| i.device_id != id);
        self.staged.device_metrics.retain(|m| m.device_id != id);
        self.staged.alert_records.retain(|_, r| r.device_id != id);
        self.staged.deleted_devices.insert(id);
        Ok(())
    }

    fn list_interfaces(&self, device: DeviceId) -> Result<Vec<Interface>, StoreError> {
        let mut interfaces: Vec<_> = self.merged_interfaces(device)?.into_values().collect();
        interfaces.sort_by_key(|i| i.if_index);
        Ok(interfaces)
    }

    fn get_interface(&self, device: DeviceId, if_index: u32) -> Result<Option<Interface>, StoreError> {
        Ok(self
            .merged_interfaces(device)?
            .into_values()
            .find(|i| i.if_index == if_index))
    }

    fn get_or_create_interface(
        &mut self,
        device: DeviceId,
        if_index: u32,
        name: &str,
    ) -> Result<(Interface, bool), StoreError> {
        if let Some(existing) = self.get_interface(device, if_index)? {
            return Ok((existing, false));
        }
        if self.get_device(device)?.is_none() {
            return Err(StoreError::NotFound(format!("device {device}")));
        }

        let interface = Interface::new(self.next_id(), device, if_index, name);
        self.staged.interfaces.insert(interface.id, interface.clone());
        Ok((interface, true))
    }

    fn save_interface(&mut self, interface: &Interface) -> Result<(), StoreError> {
        self.staged.interfaces.insert(interface.id, interface.clone());
        Ok(())
    }

    fn append_device_metric(&mut self, metric: DeviceMetric) -> Result<(), StoreError> {
        self.staged.device_metrics.push(metric);
        Ok(())
    }

    fn append_interface_metric(&mut self, metric: InterfaceMetric) -> Result<(), StoreError> {
        self.staged.interface_metrics.push(metric);
        Ok(())
    }

    fn recent_device_metrics(&self, device: DeviceId, limit: usize) -> Result<Vec<DeviceMetric>, StoreError> {
        let staged = self
            .staged
            .device_metrics
            .iter()
            .filter(|m| m.device_id == device)
            .collect();
        let tables = self.tables()?;
        Ok(newest_first(tables.device_metrics.get(&device), staged, limit))
    }

    fn recent_interface_metrics(
        &self,
        interface: InterfaceId,
        limit: usize,
    ) -> Result<Vec<InterfaceMetric>, StoreError> {
        let staged = self
            .staged
            .interface_metrics
            .iter()
            .filter(|m| m.interface_id == interface)
            .collect();
        let tables = self.tables()?;
        Ok(newest_first(tables.interface_metrics.get(&interface), staged, limit))
    }

    fn list_recipients(&self) -> Result<Vec<String>, StoreError> {
        if let Some(recipients) = &self.staged.recipients {
            return Ok(recipients.clone());
        }
        Ok(self.tables()?.recipients.clone())
    }

    fn add_recipient(&mut self, email: &str) -> Result<bool, StoreError> {
        let mut recipients = self.list_recipients()?;
        if recipients.iter().any(|r| r.eq_ignore_ascii_case(email)) {
            return Ok(false);
        }
        recipients.push(email.to_string());
        self.staged.recipients = Some(recipients);
        Ok(true)
    }

    fn remove_recipient(&mut self, email: &str) -> Result<bool, StoreError> {
        let mut recipients = self.list_recipients()?;
        let before = recipients.len();
        recipients.retain(|r| !r.eq_ignore_ascii_case(email));
        let removed = recipients.len() != before;
        self.staged.recipients = Some(recipients);
        Ok(removed)
    }

    fn insert_alert_record(&mut self, record: NewAlertRecord) -> Result<AlertRecord, StoreError> {
        let record = AlertRecord::from_new(self.next_id(), record);
        self.staged.alert_records.insert(record.id, record.clone());
        Ok(record)
    }

    fn get_alert_record(&self, id: AlertId) -> Result<Option<AlertRecord>, StoreError> {
        if let Some(record) = self.staged.alert_records.get(&id) {
            return Ok(Some(record.clone()));
        }
        Ok(self.tables()?.alert_records.get(&id).cloned())
    }

    fn save_alert_record(&mut self, record: &AlertRecord) -> Result<(), StoreError> {
        self.staged.alert_records.insert(record.id, record.clone());
        Ok(())
    }

    fn find_open_alert_record(
        &self,
        kind: AlertKind,
        device: DeviceId,
        interface: Option<InterfaceId>,
    ) -> Result<Option<AlertRecord>, StoreError> {
        Ok(self.merged_records()?.into_values().rev().find(|r| {
            r.is_open() && r.kind == kind && r.device_id == device && r.interface_id == interface
        }))
    }

    fn close_alert_record(&mut self, id: AlertId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut record = self
            .get_alert_record(id)?
            .ok_or_else(|| StoreError::NotFound(format!("alert record {id}")))?;
        record.cleared_at = Some(at);
        self.staged.alert_records.insert(id, record);
        Ok(())
    }

    fn list_alert_records(&self, device: Option<DeviceId>) -> Result<Vec<AlertRecord>, StoreError> {
        Ok(self
            .merged_records()?
            .into_values()
            .rev()
            .filter(|r| device.map_or(true, |d| r.device_id == d))
            .collect())
    }

    fn load_settings_override(&self) -> Result<SettingsOverride, StoreError> {
        if let Some(layer) = &self.staged.settings {
            return Ok(layer.clone());
        }
        Ok(self.tables()?.settings.clone())
    }

    fn save_settings_override(&mut self, layer: &SettingsOverride) -> Result<(), StoreError> {
        self.staged.settings = Some(layer.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut tables = match self.shared.tables.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(StoreError::Busy),
            Err(TryLockError::Poisoned(_)) => return Err(StoreError::Poisoned),
        };
        self.check_unique(&tables)?;

        let staged = std::mem::take(&mut self.staged);
        let cap = self.shared.samples_per_series;

        for id in &staged.deleted_devices {
            tables.devices.remove(id);
            tables.interfaces.retain(|_, i| i.device_id != *id);
            tables.device_metrics.remove(id);
            tables.alert_records.retain(|_, r| r.device_id != *id);
        }
        let live_interfaces: BTreeSet<InterfaceId> = tables.interfaces.keys().copied().collect();
        tables
            .interface_metrics
            .retain(|id, _| live_interfaces.contains(id) || staged.interfaces.contains_key(id));

        tables.devices.extend(staged.devices);
        tables.interfaces.extend(staged.interfaces);
        tables.alert_records.extend(staged.alert_records);

        for metric in staged.device_metrics {
            let series = tables.device_metrics.entry(metric.device_id).or_default();
            push_capped(series, metric, cap);
        }
        for metric in staged.interface_metrics {
            if !tables.interfaces.contains_key(&metric.interface_id) {
                continue;
            }
            let series = tables.interface_metrics.entry(metric.interface_id).or_default();
            push_capped(series, metric, cap);
        }

        if let Some(recipients) = staged.recipients {
            tables.recipients = recipients;
        }
        if let Some(settings) = staged.settings {
            tables.settings = settings;
        }
        Ok(())
    }
}
