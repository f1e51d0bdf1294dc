use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::cache::{invalidate_device, CacheInvalidator, NoopCache};
use crate::counters::interface_rates;
use crate::history;
use crate::model::{
    AlertId, AlertKind, AlertRecord, AlertSlot, AlertState, Device, Interface, InterfaceMetric, Maintenance,
    NewAlertRecord, Severity, OPER_STATUS_UP,
};
use crate::notify::{DeviceEvent, Mail, Notifier, Outbox};
use crate::store::{Repository, Session, StoreError};

/// Whether the metric is in breach now, and whether this poll is the edge
/// into breach. Device metrics are always on the edge; interface metrics
/// need a non-breaching previous sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub breaching: bool,
    pub edge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Triggered,
    Recovered,
}

pub fn advance(slot: &mut AlertSlot, observation: Observation) -> Transition {
    match (slot.state, observation.breaching) {
        (AlertState::Clear, true) if observation.edge => {
            slot.state = AlertState::Triggered;
            slot.alert_sent = true;
            Transition::Triggered
        }
        (AlertState::Triggered | AlertState::Acknowledged, false) => {
            reset(slot);
            Transition::Recovered
        }
        _ => Transition::Unchanged,
    }
}

/// Only a `triggered` slot can be acknowledged. Returns false, leaving the
/// slot untouched, otherwise.
pub fn acknowledge(slot: &mut AlertSlot, at: DateTime<Utc>) -> bool {
    if slot.state != AlertState::Triggered {
        return false;
    }
    slot.state = AlertState::Acknowledged;
    slot.acknowledged_at = Some(at);
    true
}

pub fn resolve(slot: &mut AlertSlot) {
    reset(slot);
}

fn reset(slot: &mut AlertSlot) {
    slot.state = AlertState::Clear;
    slot.acknowledged_at = None;
    slot.alert_sent = false;
}

pub fn severity(kind: AlertKind, value: f64) -> Severity {
    match kind {
        AlertKind::Cpu | AlertKind::Memory if value >= 90.0 => Severity::Critical,
        AlertKind::Cpu | AlertKind::Memory if value >= 75.0 => Severity::High,
        AlertKind::Reachability | AlertKind::InterfaceStatus => Severity::Critical,
        AlertKind::PacketDrop if value >= 5.0 => Severity::Critical,
        AlertKind::PacketDrop if value >= 1.0 => Severity::High,
        _ => Severity::Warning,
    }
}

/// True while the device's maintenance window is open. An expired window
/// is switched off here so the caller evaluates normally in the same pass.
pub fn maintenance_active(device: &mut Device, now: DateTime<Utc>) -> bool {
    if !device.maintenance.enabled {
        return false;
    }
    match device.maintenance.until {
        Some(until) if until <= now => {
            info!(device_id = device.id, host = %device.address, "maintenance window expired");
            device.maintenance = Maintenance::default();
            false
        }
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCheck {
    Reachability,
    Cpu(f64),
    Memory(f64),
}

impl DeviceCheck {
    pub fn kind(self) -> AlertKind {
        match self {
            DeviceCheck::Reachability => AlertKind::Reachability,
            DeviceCheck::Cpu(_) => AlertKind::Cpu,
            DeviceCheck::Memory(_) => AlertKind::Memory,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceOutcome {
    pub triggered: usize,
    pub recovered: usize,
}

pub struct AlertEvaluator<R: Repository> {
    notifier: Arc<Notifier<R>>,
    cache: Arc<dyn CacheInvalidator>,
}

impl<R: Repository> Clone for AlertEvaluator<R> {
    fn clone(&self) -> Self {
        Self {
            notifier: Arc::clone(&self.notifier),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<R: Repository> AlertEvaluator<R> {
    pub fn new(notifier: Arc<Notifier<R>>) -> Self {
        Self {
            notifier,
            cache: Arc::new(NoopCache),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = cache;
        self
    }

    /// Applies what `outbox` collected. Call once the session that filled
    /// it has committed.
    pub fn release(&self, outbox: Outbox) {
        for address in outbox.stale_devices() {
            invalidate_device(self.cache.as_ref(), *address);
        }
        self.notifier.release(outbox);
    }

    fn in_maintenance(&self, outbox: &mut Outbox, device: &mut Device, now: DateTime<Utc>) -> bool {
        let was_enabled = device.maintenance.enabled;
        let active = maintenance_active(device, now);
        if was_enabled && !active {
            outbox.mark_stale(device.address);
        }
        active
    }

    pub fn evaluate(
        &self,
        session: &mut dyn Session,
        outbox: &mut Outbox,
        device: &mut Device,
        check: DeviceCheck,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        if self.in_maintenance(outbox, device, now) {
            return Ok(Transition::Unchanged);
        }

        let kind = check.kind();
        let thresholds = &device.thresholds;
        let (breaching, event) = match check {
            DeviceCheck::Cpu(value) => (
                value > thresholds.cpu,
                DeviceEvent {
                    kind,
                    severity: severity(kind, value),
                    value: format!("{value:.2}%"),
                    threshold: format!("{:.2}%", thresholds.cpu),
                },
            ),
            DeviceCheck::Memory(value) => (
                value > thresholds.memory,
                DeviceEvent {
                    kind,
                    severity: severity(kind, value),
                    value: format!("{value:.2}%"),
                    threshold: format!("{:.2}%", thresholds.memory),
                },
            ),
            DeviceCheck::Reachability => (
                !device.is_reachable,
                DeviceEvent {
                    kind,
                    severity: severity(kind, 0.0),
                    value: format!("{} consecutive failures", device.consecutive_failures),
                    threshold: format!("{} failures", thresholds.failures),
                },
            ),
        };

        let Some(slot) = device.alert_mut(kind) else {
            return Ok(Transition::Unchanged);
        };
        let transition = advance(slot, Observation { breaching, edge: true });

        match transition {
            Transition::Triggered => {
                if kind == AlertKind::Reachability {
                    error!(device_id = device.id, host = %device.address, failures = device.consecutive_failures, "device unreachable");
                } else {
                    warn!(device_id = device.id, host = %device.address, %kind, value = %event.value, "alert triggered");
                }
                let record = history::open(
                    session,
                    NewAlertRecord {
                        kind,
                        severity: event.severity,
                        device_id: device.id,
                        interface_id: None,
                        triggered_at: now,
                        metric_value: event.value.clone(),
                        threshold_value: event.threshold.clone(),
                        message: Some(match kind {
                            AlertKind::Reachability => "device unreachable".to_string(),
                            _ => format!("{} above threshold", kind.display_name()),
                        }),
                    },
                )?;
                let mail = Mail::device_alert(device, &event, now);
                self.send(&*session, outbox, mail, vec![record.id])?;
            }
            Transition::Recovered => {
                info!(device_id = device.id, host = %device.address, %kind, value = %event.value, "alert recovered");
                history::auto_clear(session, kind, device.id, None, Some("returned to normal"), now)?;
                let mail = Mail::device_recovery(device, &event, now);
                self.send(&*session, outbox, mail, Vec::new())?;
            }
            Transition::Unchanged => {}
        }

        Ok(transition)
    }

    pub fn evaluate_interfaces(
        &self,
        session: &mut dyn Session,
        outbox: &mut Outbox,
        device: &mut Device,
        now: DateTime<Utc>,
    ) -> Result<InterfaceOutcome, StoreError> {
        if self.in_maintenance(outbox, device, now) {
            return Ok(InterfaceOutcome::default());
        }

        let mut alert_lines = Vec::new();
        let mut recovery_lines = Vec::new();
        let mut records: Vec<AlertId> = Vec::new();
        let mut worst = Severity::Warning;

        for mut interface in session.list_interfaces(device.id)? {
            let samples = session.recent_interface_metrics(interface.id, 3)?;
            let Some(latest) = samples.first() else {
                continue;
            };
            let previous = samples.get(1);
            let earlier = samples.get(2);
            let mut changed = false;

            let down = latest.oper_status != OPER_STATUS_UP;
            let status = Observation {
                breaching: down,
                edge: previous.is_some_and(|p| p.oper_status == OPER_STATUS_UP),
            };
            match advance(&mut interface.status_alert, status) {
                Transition::Triggered => {
                    warn!(device_id = device.id, if_index = interface.if_index, name = %interface.name, "interface down");
                    let line = format!("Interface {} ({}) is DOWN", interface.name, interface.if_index);
                    let record = self.open_interface_record(
                        session,
                        device,
                        &interface,
                        AlertKind::InterfaceStatus,
                        severity(AlertKind::InterfaceStatus, 0.0),
                        format!("oper_status={}", latest.oper_status),
                        format!("oper_status={OPER_STATUS_UP}"),
                        &line,
                        now,
                    )?;
                    worst = worst.max(record.severity);
                    records.push(record.id);
                    alert_lines.push(line);
                    changed = true;
                }
                Transition::Recovered => {
                    info!(device_id = device.id, if_index = interface.if_index, name = %interface.name, "interface up");
                    history::auto_clear(
                        session,
                        AlertKind::InterfaceStatus,
                        device.id,
                        Some(interface.id),
                        Some("interface is up"),
                        now,
                    )?;
                    recovery_lines.push(format!("Interface {} ({}) is UP", interface.name, interface.if_index));
                    changed = true;
                }
                Transition::Unchanged => {}
            }

            if let Some((rate, observation)) = drop_observation(&interface, latest, previous, earlier) {
                let threshold = interface.packet_drop_threshold;
                match advance(&mut interface.drop_alert, observation) {
                    Transition::Triggered => {
                        warn!(device_id = device.id, if_index = interface.if_index, rate, threshold, "high discard rate");
                        let line = format!(
                            "Interface {} ({}) has high discard rate: {rate:.3}% (threshold: {threshold}%)",
                            interface.name, interface.if_index
                        );
                        let record = self.open_interface_record(
                            session,
                            device,
                            &interface,
                            AlertKind::PacketDrop,
                            severity(AlertKind::PacketDrop, rate),
                            format!("{rate:.3}%"),
                            format!("{threshold}%"),
                            &line,
                            now,
                        )?;
                        worst = worst.max(record.severity);
                        records.push(record.id);
                        alert_lines.push(line);
                        changed = true;
                    }
                    Transition::Recovered => {
                        info!(device_id = device.id, if_index = interface.if_index, rate, "discard rate normal");
                        history::auto_clear(
                            session,
                            AlertKind::PacketDrop,
                            device.id,
                            Some(interface.id),
                            Some("discard rate back within threshold"),
                            now,
                        )?;
                        recovery_lines.push(format!(
                            "Interface {} ({}) discard rate is normal: {rate:.3}%",
                            interface.name, interface.if_index
                        ));
                        changed = true;
                    }
                    Transition::Unchanged => {}
                }
            }

            if changed {
                session.save_interface(&interface)?;
            }
        }

        let outcome = InterfaceOutcome {
            triggered: alert_lines.len(),
            recovered: recovery_lines.len(),
        };
        if !alert_lines.is_empty() {
            let mail = Mail::interface_alerts(device, worst, &alert_lines, now);
            self.send(&*session, outbox, mail, records)?;
        }
        if !recovery_lines.is_empty() {
            let mail = Mail::interface_recoveries(device, &recovery_lines, now);
            self.send(&*session, outbox, mail, Vec::new())?;
        }
        Ok(outcome)
    }

    pub fn force_clear_interfaces(
        &self,
        session: &mut dyn Session,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut cleared = 0;
        for mut interface in session.list_interfaces(device.id)? {
            let mut changed = false;
            for kind in AlertKind::INTERFACE {
                let Some(slot) = interface.alert_mut(kind) else {
                    continue;
                };
                if *slot == AlertSlot::default() {
                    continue;
                }
                reset(slot);
                history::auto_clear(
                    session,
                    kind,
                    device.id,
                    Some(interface.id),
                    Some("device unreachable"),
                    now,
                )?;
                changed = true;
                cleared += 1;
            }
            if changed {
                session.save_interface(&interface)?;
            }
        }
        Ok(cleared)
    }

    #[allow(clippy::too_many_arguments)]
    fn open_interface_record(
        &self,
        session: &mut dyn Session,
        device: &Device,
        interface: &Interface,
        kind: AlertKind,
        severity: Severity,
        value: String,
        threshold: String,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<AlertRecord, StoreError> {
        history::open(
            session,
            NewAlertRecord {
                kind,
                severity,
                device_id: device.id,
                interface_id: Some(interface.id),
                triggered_at: now,
                metric_value: value,
                threshold_value: threshold,
                message: Some(message.to_string()),
            },
        )
    }

    fn send(
        &self,
        session: &dyn Session,
        outbox: &mut Outbox,
        mail: Mail,
        records: Vec<AlertId>,
    ) -> Result<(), StoreError> {
        let recipients = session.list_recipients()?;
        if recipients.is_empty() {
            warn!(subject = %mail.subject, "alert raised but no recipients configured");
            return Ok(());
        }
        outbox.push(mail, recipients, records);
        Ok(())
    }
}

/// Discard rate over the two newest samples, with the edge judged against
/// the rate over the preceding pair. None until two samples exist.
fn drop_observation(
    interface: &Interface,
    latest: &InterfaceMetric,
    previous: Option<&InterfaceMetric>,
    earlier: Option<&InterfaceMetric>,
) -> Option<(f64, Observation)> {
    let previous = previous?;
    let threshold = interface.packet_drop_threshold;
    let rate = interface_rates(latest, previous).discard_rate;
    let was_breaching = earlier.is_some_and(|e| interface_rates(previous, e).discard_rate > threshold);

    Some((
        rate,
        Observation {
            breaching: rate > threshold,
            edge: !was_breaching,
        },
    ))
}
