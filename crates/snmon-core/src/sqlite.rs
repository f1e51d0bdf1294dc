use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SettingsOverride;
use crate::coordinator::{PollKind, PollLease};
use crate::memory::DEFAULT_SAMPLES_PER_SERIES;
use crate::model::{
    AlertId, AlertKind, AlertRecord, Device, DeviceId, DeviceMetric, DiscoveredDevice, Interface,
    InterfaceId, InterfaceMetric, NewAlertRecord,
};
use crate::store::{Repository, Session, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(900);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS id_sequence (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    next_id INTEGER NOT NULL
);
INSERT OR IGNORE INTO id_sequence (id, next_id) VALUES (1, 1);

CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY,
    address TEXT NOT NULL UNIQUE,
    mac_address TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_mac
    ON devices(mac_address) WHERE mac_address <> '';

CREATE TABLE IF NOT EXISTS interfaces (
    id INTEGER PRIMARY KEY,
    device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    if_index INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL,
    UNIQUE (device_id, if_index)
);

CREATE TABLE IF NOT EXISTS device_metrics (
    device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_device_metrics_device ON device_metrics(device_id);

CREATE TABLE IF NOT EXISTS interface_metrics (
    interface_id INTEGER NOT NULL REFERENCES interfaces(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_interface_metrics_interface ON interface_metrics(interface_id);

CREATE TABLE IF NOT EXISTS alert_records (
    id INTEGER PRIMARY KEY,
    device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    interface_id INTEGER,
    kind TEXT NOT NULL,
    cleared_at INTEGER,
    revision INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alert_records_open
    ON alert_records(device_id, kind) WHERE cleared_at IS NULL;

CREATE TABLE IF NOT EXISTS recipients (
    email TEXT PRIMARY KEY COLLATE NOCASE
);

CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS poll_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    kind TEXT NOT NULL,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL
);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => StoreError::Busy,
            Some(ErrorCode::ConstraintViolation) => StoreError::Constraint(err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Table {
    Devices,
    Interfaces,
    AlertRecords,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Devices => "devices",
            Table::Interfaces => "interfaces",
            Table::AlertRecords => "alert_records",
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(body)?)
}

#[derive(Debug)]
struct Shared {
    conn: Mutex<Connection>,
    samples_per_series: usize,
}

impl Shared {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    shared: Arc<Shared>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_capacity(path, DEFAULT_SAMPLES_PER_SERIES)
    }

    pub fn open_with_capacity(path: &Path, samples_per_series: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "store opened");

        Ok(Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                samples_per_series: samples_per_series.max(1),
            }),
        })
    }

    /// Cross-process poll lease over this database. A lease older than
    /// `ttl` is treated as abandoned by a crashed holder.
    pub fn poll_lease(&self, ttl: Duration) -> SqlitePollLease {
        static NEXT_HOLDER: AtomicU64 = AtomicU64::new(0);
        let holder = format!(
            "{}:{}:{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
        );
        SqlitePollLease {
            shared: Arc::clone(&self.shared),
            holder,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl Repository for SqliteStore {
    type Session = SqliteSession;

    fn begin(&self) -> Result<SqliteSession, StoreError> {
        Ok(SqliteSession {
            shared: Arc::clone(&self.shared),
            staged: Staged::default(),
            seen: Mutex::default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RecipientChange {
    Add(String),
    Remove(String),
}

#[derive(Debug, Default)]
struct Staged {
    devices: BTreeMap<DeviceId, Device>,
    new_devices: BTreeSet<DeviceId>,
    deleted_devices: BTreeSet<DeviceId>,
    interfaces: BTreeMap<InterfaceId, Interface>,
    new_interfaces: BTreeSet<InterfaceId>,
    device_metrics: Vec<DeviceMetric>,
    interface_metrics: Vec<InterfaceMetric>,
    recipients: Vec<RecipientChange>,
    alert_records: BTreeMap<AlertId, AlertRecord>,
    new_records: BTreeSet<AlertId>,
    settings: Option<SettingsOverride>,
}

#[derive(Debug)]
pub struct SqliteSession {
    shared: Arc<Shared>,
    staged: Staged,
    /// Revision of every committed row this session has read.
    seen: Mutex<HashMap<(Table, i64), i64>>,
}

impl SqliteSession {
    fn next_id(&self) -> Result<i64, StoreError> {
        let conn = self.shared.conn()?;
        let id = conn.query_row(
            "UPDATE id_sequence SET next_id = next_id + 1 WHERE id = 1 RETURNING next_id - 1",
            [],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<(Table, i64), i64>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rows<T: DeserializeOwned>(
        &self,
        table: Table,
        sql: &str,
        params: impl Params,
    ) -> Result<Vec<(i64, T)>, StoreError> {
        let raw: Vec<(i64, i64, String)> = {
            let conn = self.shared.conn()?;
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params, |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut seen = self.seen();
        raw.into_iter()
            .map(|(id, revision, body)| {
                seen.entry((table, id)).or_insert(revision);
                Ok::<_, StoreError>((id, decode(&body)?))
            })
            .collect()
    }

    fn bodies<T: DeserializeOwned>(&self, sql: &str, params: impl Params) -> Result<Vec<T>, StoreError> {
        let raw: Vec<String> = {
            let conn = self.shared.conn()?;
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params, |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        raw.iter().map(|body| decode(body)).collect()
    }

    fn committed_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        let rows: Vec<(DeviceId, Device)> = self.rows(
            Table::Devices,
            "SELECT id, revision, body FROM devices WHERE id = ?1",
            [id],
        )?;
        Ok(rows.into_iter().next().map(|(_, device)| device))
    }

    fn merged_devices(&self) -> Result<BTreeMap<DeviceId, Device>, StoreError> {
        let mut devices: BTreeMap<DeviceId, Device> = self
            .rows(Table::Devices, "SELECT id, revision, body FROM devices", [])?
            .into_iter()
            .collect();
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
        let mut interfaces: BTreeMap<InterfaceId, Interface> = self
            .rows(
                Table::Interfaces,
                "SELECT id, revision, body FROM interfaces WHERE device_id = ?1",
                [device],
            )?
            .into_iter()
            .collect();
        for (id, interface) in &self.staged.interfaces {
            if interface.device_id == device {
                interfaces.insert(*id, interface.clone());
            }
        }
        Ok(interfaces)
    }

    fn overlay_records(
        &self,
        committed: Vec<(AlertId, AlertRecord)>,
        keep: impl Fn(&AlertRecord) -> bool,
    ) -> BTreeMap<AlertId, AlertRecord> {
        let mut records: BTreeMap<_, _> = committed.into_iter().collect();
        for (id, record) in &self.staged.alert_records {
            if keep(record) {
                records.insert(*id, record.clone());
            }
        }
        records.retain(|_, r| !self.staged.deleted_devices.contains(&r.device_id));
        records
    }

    fn apply(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        let staged = &self.staged;
        let seen = self.seen();
        let expected = |table: Table, id: i64| seen.get(&(table, id)).copied();

        for id in &staged.deleted_devices {
            tx.execute("DELETE FROM devices WHERE id = ?1", [id])?;
        }

        for (id, device) in &staged.devices {
            let address = device.address.to_string();
            let body = encode(device)?;
            if staged.new_devices.contains(id) {
                tx.execute(
                    "INSERT INTO devices (id, address, mac_address, body) VALUES (?1, ?2, ?3, ?4)",
                    params![id, address, device.mac_address, body],
                )?;
            } else {
                let changed = tx.execute(
                    "UPDATE devices SET address = ?2, mac_address = ?3, body = ?4, revision = revision + 1
                     WHERE id = ?1 AND (?5 IS NULL OR revision = ?5)",
                    params![id, address, device.mac_address, body, expected(Table::Devices, *id)],
                )?;
                settle_update(tx, Table::Devices, *id, changed)?;
            }
        }

        for (id, interface) in &staged.interfaces {
            let body = encode(interface)?;
            if staged.new_interfaces.contains(id) {
                tx.execute(
                    "INSERT INTO interfaces (id, device_id, if_index, body)
                     SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM devices WHERE id = ?2)",
                    params![id, interface.device_id, interface.if_index, body],
                )?;
            } else {
                let changed = tx.execute(
                    "UPDATE interfaces SET body = ?2, revision = revision + 1
                     WHERE id = ?1 AND (?3 IS NULL OR revision = ?3)",
                    params![id, body, expected(Table::Interfaces, *id)],
                )?;
                settle_update(tx, Table::Interfaces, *id, changed)?;
            }
        }

        for (id, record) in &staged.alert_records {
            let body = encode(record)?;
            let cleared_at = record.cleared_at.map(|at| at.timestamp_millis());
            if staged.new_records.contains(id) {
                tx.execute(
                    "INSERT INTO alert_records (id, device_id, interface_id, kind, cleared_at, body)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6 WHERE EXISTS (SELECT 1 FROM devices WHERE id = ?2)",
                    params![id, record.device_id, record.interface_id, record.kind.to_string(), cleared_at, body],
                )?;
            } else {
                let changed = tx.execute(
                    "UPDATE alert_records SET cleared_at = ?2, body = ?3, revision = revision + 1
                     WHERE id = ?1 AND (?4 IS NULL OR revision = ?4)",
                    params![id, cleared_at, body, expected(Table::AlertRecords, *id)],
                )?;
                settle_update(tx, Table::AlertRecords, *id, changed)?;
            }
        }

        let cap = i64::try_from(self.shared.samples_per_series).unwrap_or(i64::MAX);
        let mut device_series = BTreeSet::new();
        for metric in &staged.device_metrics {
            tx.execute(
                "INSERT INTO device_metrics (device_id, timestamp, body)
                 SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM devices WHERE id = ?1)",
                params![metric.device_id, metric.timestamp.timestamp_millis(), encode(metric)?],
            )?;
            device_series.insert(metric.device_id);
        }
        for device in device_series {
            tx.execute(
                "DELETE FROM device_metrics WHERE device_id = ?1 AND rowid NOT IN
                 (SELECT rowid FROM device_metrics WHERE device_id = ?1 ORDER BY rowid DESC LIMIT ?2)",
                params![device, cap],
            )?;
        }

        let mut interface_series = BTreeSet::new();
        for metric in &staged.interface_metrics {
            tx.execute(
                "INSERT INTO interface_metrics (interface_id, timestamp, body)
                 SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM interfaces WHERE id = ?1)",
                params![metric.interface_id, metric.timestamp.timestamp_millis(), encode(metric)?],
            )?;
            interface_series.insert(metric.interface_id);
        }
        for interface in interface_series {
            tx.execute(
                "DELETE FROM interface_metrics WHERE interface_id = ?1 AND rowid NOT IN
                 (SELECT rowid FROM interface_metrics WHERE interface_id = ?1 ORDER BY rowid DESC LIMIT ?2)",
                params![interface, cap],
            )?;
        }

        for change in &staged.recipients {
            match change {
                RecipientChange::Add(email) => {
                    tx.execute("INSERT OR IGNORE INTO recipients (email) VALUES (?1)", [email])?;
                }
                RecipientChange::Remove(email) => {
                    tx.execute("DELETE FROM recipients WHERE email = ?1", [email])?;
                }
            }
        }

        if let Some(layer) = &staged.settings {
            tx.execute(
                "INSERT INTO settings (id, body) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                [encode(layer)?],
            )?;
        }
        Ok(())
    }
}

/// An update that touched nothing either lost a race or hit a deleted row.
/// Deleted rows stay deleted.
fn settle_update(tx: &Transaction<'_>, table: Table, id: i64, changed: usize) -> Result<(), StoreError> {
    if changed > 0 {
        return Ok(());
    }
    let still_there: Option<i64> = tx
        .query_row(
            &format!("SELECT revision FROM {} WHERE id = ?1", table.name()),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match still_there {
        None => {
            debug!(table = table.name(), id, "row deleted by another writer, update dropped");
            Ok(())
        }
        Some(_) => Err(StoreError::Conflict(format!(
            "{} row {id} was changed by another writer",
            table.name()
        ))),
    }
}

fn newest_first<T>(
    staged: Vec<T>,
    committed: impl FnOnce(usize) -> Result<Vec<T>, StoreError>,
    limit: usize,
) -> Result<Vec<T>, StoreError> {
    let mut out: Vec<T> = staged.into_iter().rev().take(limit).collect();
    let remaining = limit - out.len();
    if remaining > 0 {
        out.extend(committed(remaining)?);
    }
    Ok(out)
}

impl Session for SqliteSession {
    fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        if self.staged.deleted_devices.contains(&id) {
            return Ok(None);
        }
        if let Some(device) = self.staged.devices.get(&id) {
            return Ok(Some(device.clone()));
        }
        self.committed_device(id)
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
            None => {
                let device = Device::new(self.next_id()?, found);
                self.staged.new_devices.insert(device.id);
                (device, true)
            }
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
        let staged = &mut self.staged;
        staged.devices.remove(&id);
        staged.new_devices.remove(&id);
        staged.interfaces.retain(|_, i| i.device_id != id);
        staged.device_metrics.retain(|m| m.device_id != id);
        staged.alert_records.retain(|_, r| r.device_id != id);
        staged.deleted_devices.insert(id);
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

        let interface = Interface::new(self.next_id()?, device, if_index, name);
        self.staged.new_interfaces.insert(interface.id);
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
            .cloned()
            .collect();
        newest_first(
            staged,
            |remaining| {
                self.bodies(
                    "SELECT body FROM device_metrics WHERE device_id = ?1 ORDER BY rowid DESC LIMIT ?2",
                    params![device, i64::try_from(remaining).unwrap_or(i64::MAX)],
                )
            },
            limit,
        )
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
            .cloned()
            .collect();
        newest_first(
            staged,
            |remaining| {
                self.bodies(
                    "SELECT body FROM interface_metrics WHERE interface_id = ?1 ORDER BY rowid DESC LIMIT ?2",
                    params![interface, i64::try_from(remaining).unwrap_or(i64::MAX)],
                )
            },
            limit,
        )
    }

    fn list_recipients(&self) -> Result<Vec<String>, StoreError> {
        let mut recipients: Vec<String> = {
            let conn = self.shared.conn()?;
            let mut stmt = conn.prepare_cached("SELECT email FROM recipients ORDER BY rowid")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for change in &self.staged.recipients {
            match change {
                RecipientChange::Add(email) => {
                    if !recipients.iter().any(|r| r.eq_ignore_ascii_case(email)) {
                        recipients.push(email.clone());
                    }
                }
                RecipientChange::Remove(email) => recipients.retain(|r| !r.eq_ignore_ascii_case(email)),
            }
        }
        Ok(recipients)
    }

    fn add_recipient(&mut self, email: &str) -> Result<bool, StoreError> {
        if self.list_recipients()?.iter().any(|r| r.eq_ignore_ascii_case(email)) {
            return Ok(false);
        }
        self.staged.recipients.push(RecipientChange::Add(email.to_string()));
        Ok(true)
    }

    fn remove_recipient(&mut self, email: &str) -> Result<bool, StoreError> {
        if !self.list_recipients()?.iter().any(|r| r.eq_ignore_ascii_case(email)) {
            return Ok(false);
        }
        self.staged.recipients.push(RecipientChange::Remove(email.to_string()));
        Ok(true)
    }

    fn insert_alert_record(&mut self, record: NewAlertRecord) -> Result<AlertRecord, StoreError> {
        let record = AlertRecord::from_new(self.next_id()?, record);
        self.staged.new_records.insert(record.id);
        self.staged.alert_records.insert(record.id, record.clone());
        Ok(record)
    }

    fn get_alert_record(&self, id: AlertId) -> Result<Option<AlertRecord>, StoreError> {
        if let Some(record) = self.staged.alert_records.get(&id) {
            return Ok(Some(record.clone()));
        }
        let rows: Vec<(AlertId, AlertRecord)> = self.rows(
            Table::AlertRecords,
            "SELECT id, revision, body FROM alert_records WHERE id = ?1",
            [id],
        )?;
        Ok(rows.into_iter().next().map(|(_, record)| record))
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
        let committed: Vec<(AlertId, AlertRecord)> = self.rows(
            Table::AlertRecords,
            "SELECT id, revision, body FROM alert_records
             WHERE cleared_at IS NULL AND kind = ?1 AND device_id = ?2 AND interface_id IS ?3",
            params![kind.to_string(), device, interface],
        )?;
        let matching = |r: &AlertRecord| r.kind == kind && r.device_id == device && r.interface_id == interface;
        Ok(self
            .overlay_records(committed, matching)
            .into_values()
            .rev()
            .find(AlertRecord::is_open))
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
        let committed: Vec<(AlertId, AlertRecord)> = match device {
            Some(device) => self.rows(
                Table::AlertRecords,
                "SELECT id, revision, body FROM alert_records WHERE device_id = ?1",
                [device],
            )?,
            None => self.rows(Table::AlertRecords, "SELECT id, revision, body FROM alert_records", [])?,
        };
        Ok(self
            .overlay_records(committed, |r| device.map_or(true, |d| r.device_id == d))
            .into_values()
            .rev()
            .collect())
    }

    fn load_settings_override(&self) -> Result<SettingsOverride, StoreError> {
        if let Some(layer) = &self.staged.settings {
            return Ok(layer.clone());
        }
        let body: Option<String> = self
            .shared
            .conn()?
            .query_row("SELECT body FROM settings WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        body.map_or_else(|| Ok(SettingsOverride::default()), |body| decode(&body))
    }

    fn save_settings_override(&mut self, layer: &SettingsOverride) -> Result<(), StoreError> {
        self.staged.settings = Some(layer.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut conn = match self.shared.conn.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(StoreError::Busy),
            Err(TryLockError::Poisoned(_)) => return Err(StoreError::Poisoned),
        };
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.apply(&tx)?;
        tx.commit()?;
        drop(conn);

        self.staged = Staged::default();
        self.seen().clear();
        Ok(())
    }
}

#[derive(Debug)]
pub struct SqlitePollLease {
    shared: Arc<Shared>,
    holder: String,
    ttl_ms: i64,
}

fn parse_kind(kind: &str) -> PollKind {
    match kind {
        "manual" => PollKind::Manual,
        _ => PollKind::Automatic,
    }
}

impl PollLease for SqlitePollLease {
    fn acquire(&self, kind: PollKind) -> Result<Option<PollKind>, StoreError> {
        let mut conn = self.shared.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().timestamp_millis();

        let current: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT kind, holder, acquired_at FROM poll_lease WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((running, holder, acquired_at)) = current {
            if holder != self.holder {
                if now.saturating_sub(acquired_at) < self.ttl_ms {
                    return Ok(Some(parse_kind(&running)));
                }
                warn!(holder = %holder, kind = %running, "taking over abandoned poll lease");
            }
        }

        tx.execute(
            "INSERT INTO poll_lease (id, kind, holder, acquired_at) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, holder = excluded.holder,
                 acquired_at = excluded.acquired_at",
            params![kind.to_string(), self.holder, now],
        )?;
        tx.commit()?;
        Ok(None)
    }

    fn release(&self) -> Result<(), StoreError> {
        self.shared
            .conn()?
            .execute("DELETE FROM poll_lease WHERE id = 1 AND holder = ?1", [&self.holder])?;
        Ok(())
    }

    fn holder(&self) -> Result<Option<PollKind>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let current: Option<(String, i64)> = self
            .shared
            .conn()?
            .query_row("SELECT kind, acquired_at FROM poll_lease WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        Ok(current
            .filter(|(_, acquired_at)| now.saturating_sub(*acquired_at) < self.ttl_ms)
            .map(|(kind, _)| parse_kind(&kind)))
    }
}
