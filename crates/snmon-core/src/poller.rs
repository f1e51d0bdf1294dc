use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEvaluator, DeviceCheck};
use crate::config::{ConfigProvider, Settings};
use crate::model::{Device, DeviceId, DeviceMetric, InterfaceCounters, InterfaceMetric, SpeedSource};
use crate::notify::Outbox;
use crate::oids::{if_mib, DEVICE_OIDS, SYS_UPTIME};
use crate::snmp::{SnmpClient, SnmpTarget, SnmpValue, WalkRow};
use crate::store::{commit_with_retry, Repository, RetryPolicy, Session, StoreError};

/// ifSpeed saturates at this value on links faster than ~4.29 Gbps.
const IF_SPEED_SATURATED: u64 = 4_294_967_295;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub cycle_time: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceOutcome {
    Polled,
    Failed,
    Missing,
}

pub fn detect_speed(row: &WalkRow) -> Option<(u64, SpeedSource)> {
    let read = |oid: &str| row.get(oid).and_then(SnmpValue::as_u64);

    if let Some(mbps) = read(if_mib::HIGH_SPEED).filter(|v| *v > 0) {
        return Some((mbps.saturating_mul(1_000_000), SpeedSource::IfHighSpeed));
    }
    read(if_mib::SPEED)
        .filter(|v| *v > 0 && *v < IF_SPEED_SATURATED)
        .map(|bps| (bps, SpeedSource::IfSpeed))
}

/// ifXTable high-capacity columns where the agent has them, falling back
/// column by column to the 32-bit ifTable counters.
pub(crate) fn read_counters(row: &WalkRow) -> InterfaceCounters {
    let read = |oid: &str| row.get(oid).and_then(SnmpValue::as_u64);
    let counter = |hc: &str, legacy: &str| read(hc).or_else(|| read(legacy)).unwrap_or(0);
    let non_unicast = |multicast: &str, broadcast: &str, legacy: &str| match (read(multicast), read(broadcast)) {
        (None, None) => read(legacy).unwrap_or(0),
        (m, b) => m.unwrap_or(0).saturating_add(b.unwrap_or(0)),
    };

    InterfaceCounters {
        octets_in: counter(if_mib::HC_IN_OCTETS, if_mib::IN_OCTETS),
        octets_out: counter(if_mib::HC_OUT_OCTETS, if_mib::OUT_OCTETS),
        errors_in: read(if_mib::IN_ERRORS).unwrap_or(0),
        errors_out: read(if_mib::OUT_ERRORS).unwrap_or(0),
        discards_in: read(if_mib::IN_DISCARDS).unwrap_or(0),
        discards_out: read(if_mib::OUT_DISCARDS).unwrap_or(0),
        packets_in: counter(if_mib::HC_IN_UCAST_PKTS, if_mib::IN_UCAST_PKTS).saturating_add(non_unicast(
            if_mib::HC_IN_MULTICAST_PKTS,
            if_mib::HC_IN_BROADCAST_PKTS,
            if_mib::IN_NUCAST_PKTS,
        )),
        packets_out: counter(if_mib::HC_OUT_UCAST_PKTS, if_mib::OUT_UCAST_PKTS).saturating_add(non_unicast(
            if_mib::HC_OUT_MULTICAST_PKTS,
            if_mib::HC_OUT_BROADCAST_PKTS,
            if_mib::OUT_NUCAST_PKTS,
        )),
    }
}

pub struct Poller<R: Repository> {
    client: Arc<dyn SnmpClient>,
    repo: Arc<R>,
    config: Arc<dyn ConfigProvider>,
    evaluator: AlertEvaluator<R>,
    retry: RetryPolicy,
}

impl<R: Repository> Clone for Poller<R> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            repo: Arc::clone(&self.repo),
            config: Arc::clone(&self.config),
            evaluator: self.evaluator.clone(),
            retry: self.retry,
        }
    }
}

impl<R: Repository> Poller<R> {
    pub fn new(
        client: Arc<dyn SnmpClient>,
        repo: Arc<R>,
        config: Arc<dyn ConfigProvider>,
        evaluator: AlertEvaluator<R>,
    ) -> Self {
        Self {
            client,
            repo,
            config,
            evaluator,
            retry: RetryPolicy::default(),
        }
    }

    /// One pass over every known device. Every sample written in the pass
    /// carries the same `cycle_time`. A failing device only shows up in the
    /// `failed` count.
    pub async fn run_cycle(&self) -> Result<PollSummary, StoreError> {
        let settings = self.config.snapshot();
        let device_ids = {
            let session = self.repo.begin()?;
            session.list_device_ids()?
        };
        let cycle_time = Utc::now();

        let mut summary = PollSummary {
            cycle_time,
            total: device_ids.len(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
        };
        if device_ids.is_empty() {
            info!("no devices to poll");
            return Ok(summary);
        }
        debug!(cycle_time = %cycle_time.to_rfc3339(), devices = device_ids.len(), "poll cycle started");

        let gate = Arc::new(Semaphore::new(settings.polling_concurrency.max(1)));
        let settings = Arc::new(settings);
        let mut tasks = JoinSet::new();

        for device_id in device_ids {
            let gate = Arc::clone(&gate);
            let settings = Arc::clone(&settings);
            let poller = self.clone();

            tasks.spawn(async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return DeviceOutcome::Failed;
                };
                match poller.poll_one(device_id, &settings, cycle_time).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(device_id, error = %err, "device poll aborted");
                        DeviceOutcome::Failed
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(DeviceOutcome::Polled) => summary.succeeded += 1,
                Ok(DeviceOutcome::Failed) => summary.failed += 1,
                Ok(DeviceOutcome::Missing) => summary.skipped += 1,
                Err(err) => {
                    error!(error = %err, "device poll task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            total = summary.total,
            "poll cycle complete"
        );
        Ok(summary)
    }

    async fn poll_one(
        &self,
        device_id: DeviceId,
        settings: &Settings,
        cycle_time: DateTime<Utc>,
    ) -> Result<DeviceOutcome, StoreError> {
        let mut session = self.repo.begin()?;
        let Some(mut device) = session.get_device(device_id)? else {
            warn!(device_id, "device vanished before polling");
            return Ok(DeviceOutcome::Missing);
        };
        let target = SnmpTarget::new(device.address, settings);
        let mut outbox = Outbox::default();

        let outcome = if self
            .poll_device(&mut session, &mut outbox, &mut device, &target, cycle_time)
            .await?
        {
            self.poll_interfaces(&mut session, &mut outbox, &mut device, &target, cycle_time)
                .await?;
            DeviceOutcome::Polled
        } else {
            if !device.is_reachable {
                let cleared = self
                    .evaluator
                    .force_clear_interfaces(&mut session, &device, cycle_time)?;
                if cleared > 0 {
                    info!(device_id, host = %device.address, cleared, "cleared interface alerts of unreachable device");
                }
                debug!(device_id, host = %device.address, "skipping interface poll for unreachable device");
            }
            DeviceOutcome::Failed
        };

        session.save_device(&device)?;
        commit_with_retry(&mut session, &self.retry).await?;
        self.evaluator.release(outbox);
        Ok(outcome)
    }

    async fn poll_device(
        &self,
        session: &mut R::Session,
        outbox: &mut Outbox,
        device: &mut Device,
        target: &SnmpTarget,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        device.last_poll_attempt = Some(now);

        let oids: Vec<&'static str> = DEVICE_OIDS
            .iter()
            .chain(device.vendor.health_oids())
            .copied()
            .collect();

        let values = match self.client.get(target, &oids).await {
            Ok(values) => values,
            Err(err) => {
                warn!(device_id = device.id, host = %device.address, error = %err, "snmp poll failed");
                device.consecutive_failures = device.consecutive_failures.saturating_add(1);
                if device.is_reachable && device.consecutive_failures >= device.thresholds.failures {
                    device.is_reachable = false;
                    error!(
                        device_id = device.id,
                        host = %device.address,
                        failures = device.consecutive_failures,
                        "device marked unreachable"
                    );
                }
                self.evaluator
                    .evaluate(session, outbox, device, DeviceCheck::Reachability, now)?;
                return Ok(false);
            }
        };

        device.last_poll_success = Some(now);
        device.consecutive_failures = 0;
        if !device.is_reachable {
            device.is_reachable = true;
            info!(device_id = device.id, host = %device.address, "device reachable again");
        }
        self.evaluator
            .evaluate(session, outbox, device, DeviceCheck::Reachability, now)?;

        let by_oid: HashMap<&str, SnmpValue> = oids.iter().copied().zip(values).collect();
        let health = device.vendor.health(&by_oid);
        self.evaluator
            .evaluate(session, outbox, device, DeviceCheck::Cpu(health.cpu), now)?;
        self.evaluator
            .evaluate(session, outbox, device, DeviceCheck::Memory(health.memory), now)?;

        let uptime_seconds = by_oid
            .get(SYS_UPTIME)
            .and_then(SnmpValue::as_u64)
            .map(|ticks| ticks / 100)
            .unwrap_or(0);
        session.append_device_metric(DeviceMetric {
            device_id: device.id,
            timestamp: now,
            cpu_utilization: health.cpu,
            memory_utilization: health.memory,
            uptime_seconds,
        })?;
        Ok(true)
    }

    async fn poll_interfaces(
        &self,
        session: &mut R::Session,
        outbox: &mut Outbox,
        device: &mut Device,
        target: &SnmpTarget,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let table = match self.client.bulk_walk(target, &if_mib::WALK).await {
            Ok(table) => table,
            Err(err) => {
                warn!(device_id = device.id, host = %device.address, error = %err, "interface walk failed");
                return Ok(0);
            }
        };

        for (if_index, row) in &table {
            let name = row
                .get(if_mib::DESCR)
                .and_then(SnmpValue::as_text)
                .unwrap_or_else(|| format!("if{if_index}"));
            let (mut interface, created) = session.get_or_create_interface(device.id, *if_index, &name)?;

            match detect_speed(row) {
                Some((bps, source)) if interface.speed_bps != Some(bps) => {
                    debug!(
                        host = %device.address,
                        if_index,
                        name = %interface.name,
                        speed_bps = bps,
                        source = ?source,
                        "interface speed detected"
                    );
                    interface.speed_bps = Some(bps);
                    interface.speed_source = Some(source);
                    interface.speed_last_updated = Some(now);
                    session.save_interface(&interface)?;
                }
                None if created => {
                    debug!(host = %device.address, if_index, name = %interface.name, "no interface speed reported");
                }
                _ => {}
            }

            let status = |oid: &str| row.get(oid).and_then(SnmpValue::as_i64).unwrap_or(0);
            session.append_interface_metric(InterfaceMetric {
                interface_id: interface.id,
                timestamp: now,
                admin_status: status(if_mib::ADMIN_STATUS),
                oper_status: status(if_mib::OPER_STATUS),
                counters: read_counters(row),
            })?;
        }

        let outcome = self.evaluator.evaluate_interfaces(session, outbox, device, now)?;
        debug!(
            device_id = device.id,
            interfaces = table.len(),
            triggered = outcome.triggered,
            recovered = outcome.recovered,
            "interfaces polled"
        );
        Ok(table.len())
    }
}
