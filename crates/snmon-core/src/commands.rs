use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::info;

use crate::alerts;
use crate::cache::{invalidate_device, CacheInvalidator};
use crate::config::SettingsOverride;
use crate::history;
use crate::model::{AlertKind, AlertRecord, AlertSlot, Device, Interface, UserAction};
use crate::store::{commit_with_retry, Repository, RetryPolicy, Session, StoreError};

pub const MAINTENANCE_MINUTES_MAX: u32 = 1_440;
pub const DEFAULT_MAINTENANCE_MINUTES: u32 = 60;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("device {0} not found")]
    DeviceNotFound(Ipv4Addr),
    #[error("interface {if_index} not found on {address}")]
    InterfaceNotFound { address: Ipv4Addr, if_index: u32 },
    #[error("no active {0} alert")]
    NoActiveAlert(AlertKind),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("{kind} alerts do not apply to {scope}")]
    WrongScope { kind: AlertKind, scope: &'static str },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertTarget {
    Device {
        address: Ipv4Addr,
        kind: AlertKind,
    },
    Interface {
        address: Ipv4Addr,
        if_index: u32,
        kind: AlertKind,
    },
}

impl AlertTarget {
    fn kind(self) -> AlertKind {
        match self {
            AlertTarget::Device { kind, .. } | AlertTarget::Interface { kind, .. } => kind,
        }
    }

    fn address(self) -> Ipv4Addr {
        match self {
            AlertTarget::Device { address, .. } | AlertTarget::Interface { address, .. } => address,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThresholdUpdate {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub failures: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Acknowledge,
    Resolve,
}

pub struct Operator<R: Repository> {
    repo: Arc<R>,
    cache: Arc<dyn CacheInvalidator>,
    retry: RetryPolicy,
}

fn percent(field: &str, value: f64) -> Result<f64, CommandError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(CommandError::InvalidValue(format!("{field} must be within 0-100, got {value}")))
    }
}

fn device_by_address(session: &dyn Session, address: Ipv4Addr) -> Result<Device, CommandError> {
    session
        .get_device_by_address(address)?
        .ok_or(CommandError::DeviceNotFound(address))
}

impl<R: Repository> Operator<R> {
    pub fn new(repo: Arc<R>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            repo,
            cache,
            retry: RetryPolicy::default(),
        }
    }

    /// Moves a `triggered` alert to `acknowledged`. Any other state is
    /// rejected with `NoActiveAlert` and nothing changes.
    pub async fn acknowledge(
        &self,
        target: AlertTarget,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<AlertSlot, CommandError> {
        self.apply(target, Action::Acknowledge, actor, notes).await
    }

    pub async fn resolve(
        &self,
        target: AlertTarget,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<AlertSlot, CommandError> {
        self.apply(target, Action::Resolve, actor, notes).await
    }

    async fn apply(
        &self,
        target: AlertTarget,
        action: Action,
        actor: &str,
        notes: Option<&str>,
    ) -> Result<AlertSlot, CommandError> {
        let kind = target.kind();
        let now = Utc::now();
        let mut session = self.repo.begin()?;
        let mut device = device_by_address(&session, target.address())?;

        let (slot, interface_id) = match target {
            AlertTarget::Device { .. } => {
                let slot = device.alert_mut(kind).ok_or(CommandError::WrongScope {
                    kind,
                    scope: "devices",
                })?;
                (transition(slot, action, kind, now)?, None)
            }
            AlertTarget::Interface { address, if_index, .. } => {
                let mut interface = session
                    .get_interface(device.id, if_index)?
                    .ok_or(CommandError::InterfaceNotFound { address, if_index })?;
                let slot = interface.alert_mut(kind).ok_or(CommandError::WrongScope {
                    kind,
                    scope: "interfaces",
                })?;
                let slot = transition(slot, action, kind, now)?;
                session.save_interface(&interface)?;
                (slot, Some(interface.id))
            }
        };

        let user_action = match action {
            Action::Acknowledge => UserAction::Acknowledged,
            Action::Resolve => UserAction::Resolved,
        };
        if let Some(record) = history::find_open(&session, kind, device.id, interface_id)? {
            history::record_user_action(&mut session, record.id, user_action, actor, notes, now)?;
        }

        if interface_id.is_none() {
            session.save_device(&device)?;
        }
        commit_with_retry(&mut session, &self.retry).await?;

        info!(host = %device.address, %kind, action = ?user_action, actor, state = %slot.state, "alert updated by operator");
        Ok(slot)
    }

    pub async fn update_thresholds(
        &self,
        address: Ipv4Addr,
        update: ThresholdUpdate,
    ) -> Result<Device, CommandError> {
        let cpu = update.cpu.map(|v| percent("cpu threshold", v)).transpose()?;
        let memory = update.memory.map(|v| percent("memory threshold", v)).transpose()?;
        if let Some(failures) = update.failures.filter(|f| !(1..=10).contains(f)) {
            return Err(CommandError::InvalidValue(format!(
                "failure threshold must be within 1-10, got {failures}"
            )));
        }

        let mut session = self.repo.begin()?;
        let mut device = device_by_address(&session, address)?;
        if let Some(cpu) = cpu {
            device.thresholds.cpu = cpu;
        }
        if let Some(memory) = memory {
            device.thresholds.memory = memory;
        }
        if let Some(failures) = update.failures {
            device.thresholds.failures = failures;
        }
        session.save_device(&device)?;
        commit_with_retry(&mut session, &self.retry).await?;

        invalidate_device(self.cache.as_ref(), address);
        info!(host = %address, cpu = device.thresholds.cpu, memory = device.thresholds.memory, failures = device.thresholds.failures, "thresholds updated");
        Ok(device)
    }

    pub async fn update_interface_threshold(
        &self,
        address: Ipv4Addr,
        if_index: u32,
        threshold: f64,
    ) -> Result<Interface, CommandError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(CommandError::InvalidValue(format!(
                "packet drop threshold must be non-negative, got {threshold}"
            )));
        }

        let mut session = self.repo.begin()?;
        let device = device_by_address(&session, address)?;
        let mut interface = session
            .get_interface(device.id, if_index)?
            .ok_or(CommandError::InterfaceNotFound { address, if_index })?;
        interface.packet_drop_threshold = threshold;
        session.save_interface(&interface)?;
        commit_with_retry(&mut session, &self.retry).await?;

        invalidate_device(self.cache.as_ref(), address);
        info!(host = %address, if_index, threshold, "interface threshold updated");
        Ok(interface)
    }

    /// Enabling opens a window of `minutes` (1 to 1440) from now;
    /// disabling clears the window and reason.
    pub async fn set_maintenance(
        &self,
        address: Ipv4Addr,
        enabled: bool,
        minutes: u32,
        reason: Option<&str>,
    ) -> Result<Device, CommandError> {
        if enabled && !(1..=MAINTENANCE_MINUTES_MAX).contains(&minutes) {
            return Err(CommandError::InvalidValue(format!(
                "maintenance duration must be within 1-{MAINTENANCE_MINUTES_MAX} minutes, got {minutes}"
            )));
        }

        let mut session = self.repo.begin()?;
        let mut device = device_by_address(&session, address)?;
        device.maintenance.enabled = enabled;
        if enabled {
            device.maintenance.until = Some(Utc::now() + Duration::minutes(i64::from(minutes)));
            device.maintenance.reason = reason.map(str::to_string);
        } else {
            device.maintenance.until = None;
            device.maintenance.reason = None;
        }
        session.save_device(&device)?;
        commit_with_retry(&mut session, &self.retry).await?;

        invalidate_device(self.cache.as_ref(), address);
        info!(host = %address, enabled, until = ?device.maintenance.until, "maintenance updated");
        Ok(device)
    }

    pub fn devices(&self) -> Result<Vec<Device>, CommandError> {
        Ok(self.repo.begin()?.list_devices()?)
    }

    pub fn interfaces(&self, address: Ipv4Addr) -> Result<Vec<Interface>, CommandError> {
        let session = self.repo.begin()?;
        let device = device_by_address(&session, address)?;
        Ok(session.list_interfaces(device.id)?)
    }

    pub async fn remove_device(&self, address: Ipv4Addr) -> Result<(), CommandError> {
        let mut session = self.repo.begin()?;
        let device = device_by_address(&session, address)?;
        session.delete_device(device.id)?;
        commit_with_retry(&mut session, &self.retry).await?;

        invalidate_device(self.cache.as_ref(), address);
        info!(host = %address, device_id = device.id, "device removed");
        Ok(())
    }

    pub fn alert_history(&self, address: Option<Ipv4Addr>) -> Result<Vec<AlertRecord>, CommandError> {
        let session = self.repo.begin()?;
        let device = match address {
            Some(address) => Some(device_by_address(&session, address)?.id),
            None => None,
        };
        Ok(session.list_alert_records(device)?)
    }

    pub fn recipients(&self) -> Result<Vec<String>, CommandError> {
        Ok(self.repo.begin()?.list_recipients()?)
    }

    pub async fn add_recipient(&self, email: &str) -> Result<bool, CommandError> {
        let email = email.trim();
        if !looks_like_email(email) {
            return Err(CommandError::InvalidValue(format!("invalid email address {email}")));
        }
        let mut session = self.repo.begin()?;
        let added = session.add_recipient(email)?;
        commit_with_retry(&mut session, &self.retry).await?;
        Ok(added)
    }

    pub async fn remove_recipient(&self, email: &str) -> Result<bool, CommandError> {
        let mut session = self.repo.begin()?;
        let removed = session.remove_recipient(email.trim())?;
        commit_with_retry(&mut session, &self.retry).await?;
        Ok(removed)
    }

    pub async fn update_settings(&self, layer: SettingsOverride) -> Result<SettingsOverride, CommandError> {
        let mut session = self.repo.begin()?;
        let mut stored = session.load_settings_override()?;
        stored.merge(layer);
        session.save_settings_override(&stored)?;
        commit_with_retry(&mut session, &self.retry).await?;
        Ok(stored)
    }
}

fn transition(
    slot: &mut AlertSlot,
    action: Action,
    kind: AlertKind,
    now: chrono::DateTime<Utc>,
) -> Result<AlertSlot, CommandError> {
    match action {
        Action::Acknowledge => {
            if !alerts::acknowledge(slot, now) {
                return Err(CommandError::NoActiveAlert(kind));
            }
        }
        Action::Resolve => alerts::resolve(slot),
    }
    Ok(slot.clone())
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}
