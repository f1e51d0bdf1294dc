use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::oids::Vendor;

pub type DeviceId = i64;
pub type InterfaceId = i64;
pub type AlertId = i64;

pub const OPER_STATUS_UP: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    #[default]
    Clear,
    Triggered,
    Acknowledged,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertState::Clear => "clear",
            AlertState::Triggered => "triggered",
            AlertState::Acknowledged => "acknowledged",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertSlot {
    pub state: AlertState,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub alert_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Cpu,
    Memory,
    Reachability,
    InterfaceStatus,
    PacketDrop,
}

impl AlertKind {
    pub const DEVICE: [AlertKind; 3] = [AlertKind::Cpu, AlertKind::Memory, AlertKind::Reachability];
    pub const INTERFACE: [AlertKind; 2] = [AlertKind::InterfaceStatus, AlertKind::PacketDrop];

    pub fn is_interface(self) -> bool {
        matches!(self, AlertKind::InterfaceStatus | AlertKind::PacketDrop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Cpu => "cpu",
            AlertKind::Memory => "memory",
            AlertKind::Reachability => "reachability",
            AlertKind::InterfaceStatus => "interface_status",
            AlertKind::PacketDrop => "packet_drop",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AlertKind::Cpu => "CPU",
            AlertKind::Memory => "Memory",
            AlertKind::Reachability => "Reachability",
            AlertKind::InterfaceStatus => "interface status",
            AlertKind::PacketDrop => "packet drop",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Warning => "Warning",
            Severity::High => "High",
            Severity::Critical => "Critical",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu: f64,
    pub memory: f64,
    pub failures: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory: 80.0,
            failures: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Maintenance {
    pub enabled: bool,
    pub until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub address: Ipv4Addr,
    pub hostname: String,
    pub mac_address: String,
    pub vendor: Vendor,
    pub thresholds: Thresholds,
    pub is_reachable: bool,
    pub consecutive_failures: u32,
    pub last_poll_attempt: Option<DateTime<Utc>>,
    pub last_poll_success: Option<DateTime<Utc>>,
    pub maintenance: Maintenance,
    pub cpu_alert: AlertSlot,
    pub memory_alert: AlertSlot,
    pub reachability_alert: AlertSlot,
}

impl Device {
    pub fn new(id: DeviceId, found: &DiscoveredDevice) -> Self {
        Self {
            id,
            address: found.address,
            hostname: found.hostname.clone(),
            mac_address: found.mac_address.clone(),
            vendor: found.vendor,
            thresholds: Thresholds::default(),
            is_reachable: true,
            consecutive_failures: 0,
            last_poll_attempt: None,
            last_poll_success: None,
            maintenance: Maintenance::default(),
            cpu_alert: AlertSlot::default(),
            memory_alert: AlertSlot::default(),
            reachability_alert: AlertSlot::default(),
        }
    }

    pub fn alert(&self, kind: AlertKind) -> Option<&AlertSlot> {
        match kind {
            AlertKind::Cpu => Some(&self.cpu_alert),
            AlertKind::Memory => Some(&self.memory_alert),
            AlertKind::Reachability => Some(&self.reachability_alert),
            AlertKind::InterfaceStatus | AlertKind::PacketDrop => None,
        }
    }

    pub fn alert_mut(&mut self, kind: AlertKind) -> Option<&mut AlertSlot> {
        match kind {
            AlertKind::Cpu => Some(&mut self.cpu_alert),
            AlertKind::Memory => Some(&mut self.memory_alert),
            AlertKind::Reachability => Some(&mut self.reachability_alert),
            AlertKind::InterfaceStatus | AlertKind::PacketDrop => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedSource {
    #[serde(rename = "ifHighSpeed")]
    IfHighSpeed,
    #[serde(rename = "ifSpeed")]
    IfSpeed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub id: InterfaceId,
    pub device_id: DeviceId,
    pub if_index: u32,
    pub name: String,
    pub speed_bps: Option<u64>,
    pub speed_source: Option<SpeedSource>,
    pub speed_last_updated: Option<DateTime<Utc>>,
    pub packet_drop_threshold: f64,
    pub status_alert: AlertSlot,
    pub drop_alert: AlertSlot,
}

impl Interface {
    pub const DEFAULT_DROP_THRESHOLD: f64 = 0.1;

    pub fn new(id: InterfaceId, device_id: DeviceId, if_index: u32, name: &str) -> Self {
        Self {
            id,
            device_id,
            if_index,
            name: name.to_string(),
            speed_bps: None,
            speed_source: None,
            speed_last_updated: None,
            packet_drop_threshold: Self::DEFAULT_DROP_THRESHOLD,
            status_alert: AlertSlot::default(),
            drop_alert: AlertSlot::default(),
        }
    }

    pub fn alert(&self, kind: AlertKind) -> Option<&AlertSlot> {
        match kind {
            AlertKind::InterfaceStatus => Some(&self.status_alert),
            AlertKind::PacketDrop => Some(&self.drop_alert),
            _ => None,
        }
    }

    pub fn alert_mut(&mut self, kind: AlertKind) -> Option<&mut AlertSlot> {
        match kind {
            AlertKind::InterfaceStatus => Some(&mut self.status_alert),
            AlertKind::PacketDrop => Some(&mut self.drop_alert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetric {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub octets_in: u64,
    pub octets_out: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub discards_in: u64,
    pub discards_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMetric {
    pub interface_id: InterfaceId,
    pub timestamp: DateTime<Utc>,
    pub admin_status: i64,
    pub oper_status: i64,
    pub counters: InterfaceCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Acknowledged,
    Resolved,
    AutoCleared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlertRecord {
    pub kind: AlertKind,
    pub severity: Severity,
    pub device_id: DeviceId,
    pub interface_id: Option<InterfaceId>,
    pub triggered_at: DateTime<Utc>,
    pub metric_value: String,
    pub threshold_value: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: AlertId,
    pub kind: AlertKind,
    pub severity: Severity,
    pub device_id: DeviceId,
    pub interface_id: Option<InterfaceId>,
    pub triggered_at: DateTime<Utc>,
    pub metric_value: String,
    pub threshold_value: String,
    pub message: Option<String>,
    pub email_status: EmailStatus,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub email_recipients: Vec<String>,
    pub email_error: Option<String>,
    pub action: Option<UserAction>,
    pub action_at: Option<DateTime<Utc>>,
    pub action_by: Option<String>,
    pub action_notes: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl AlertRecord {
    pub fn from_new(id: AlertId, new: NewAlertRecord) -> Self {
        Self {
            id,
            kind: new.kind,
            severity: new.severity,
            device_id: new.device_id,
            interface_id: new.interface_id,
            triggered_at: new.triggered_at,
            metric_value: new.metric_value,
            threshold_value: new.threshold_value,
            message: new.message,
            email_status: EmailStatus::Pending,
            email_sent_at: None,
            email_recipients: Vec::new(),
            email_error: None,
            action: None,
            action_at: None,
            action_by: None,
            action_notes: None,
            cleared_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.cleared_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: Ipv4Addr,
    pub hostname: String,
    pub mac_address: String,
    pub vendor: Vendor,
}
