use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::history;
use crate::model::{AlertId, AlertKind, Device, Severity};
use crate::store::Repository;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NotifyError {
    #[error("email configuration missing")]
    NotConfigured,
    #[error("no recipients")]
    NoRecipients,
    #[error("invalid address {0}")]
    Address(String),
    #[error("smtp error: {0}")]
    Smtp(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub subject: String,
    pub body: String,
}

const FOOTER: &str = "This is an automated notification from the SNMP monitor. Please do not reply.";

fn host_label(device: &Device) -> String {
    if device.hostname.is_empty() {
        device.address.to_string()
    } else {
        device.hostname.clone()
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn alert_title(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::Cpu => "CPU Usage Alert",
        AlertKind::Memory => "Memory Usage Alert",
        AlertKind::Reachability => "Device Unreachable",
        AlertKind::InterfaceStatus | AlertKind::PacketDrop => "Interface Alert(s)",
    }
}

fn recovery_title(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::Cpu => "CPU Usage Normal",
        AlertKind::Memory => "Memory Usage Normal",
        AlertKind::Reachability => "Device Recovered",
        AlertKind::InterfaceStatus | AlertKind::PacketDrop => "Interface Recovery",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub kind: AlertKind,
    pub severity: Severity,
    pub value: String,
    pub threshold: String,
}

impl Mail {
    pub fn device_alert(device: &Device, event: &DeviceEvent, at: DateTime<Utc>) -> Self {
        let host = host_label(device);
        let subject = format!(
            "[{}] {} - {host}",
            event.severity.to_string().to_uppercase(),
            alert_title(event.kind)
        );

        let mut body = String::new();
        let _ = writeln!(body, "Alert type:  {}", alert_title(event.kind));
        let _ = writeln!(body, "Severity:    {}", event.severity);
        let _ = writeln!(body, "Device:      {host}");
        let _ = writeln!(body, "Address:     {}", device.address);
        let _ = writeln!(body, "Timestamp:   {}", stamp(at));
        let _ = writeln!(body);
        let _ = writeln!(body, "Current value: {}", event.value);
        let _ = writeln!(body, "Threshold:     {}", event.threshold);
        let _ = writeln!(body);
        let _ = writeln!(body, "Acknowledge this alert once it is being handled.");
        let _ = writeln!(body);
        body.push_str(FOOTER);

        Self { subject, body }
    }

    pub fn device_recovery(device: &Device, event: &DeviceEvent, at: DateTime<Utc>) -> Self {
        let host = host_label(device);
        let subject = format!("[RESOLVED] {} - {host}", recovery_title(event.kind));

        let mut body = String::new();
        let _ = writeln!(body, "Alert type:  {}", recovery_title(event.kind));
        let _ = writeln!(body, "Device:      {host}");
        let _ = writeln!(body, "Address:     {}", device.address);
        let _ = writeln!(body, "Timestamp:   {}", stamp(at));
        let _ = writeln!(body);
        let _ = writeln!(body, "Current value: {}", event.value);
        let _ = writeln!(body, "Threshold:     {}", event.threshold);
        let _ = writeln!(body);
        let _ = writeln!(body, "The alert has been cleared automatically.");
        let _ = writeln!(body);
        body.push_str(FOOTER);

        Self { subject, body }
    }

    pub fn interface_alerts(device: &Device, severity: Severity, lines: &[String], at: DateTime<Utc>) -> Self {
        let host = host_label(device);
        let subject = format!(
            "[{}] {} - {host}",
            severity.to_string().to_uppercase(),
            alert_title(AlertKind::InterfaceStatus)
        );
        Self {
            subject,
            body: interface_body("Affected interfaces", device, lines, at),
        }
    }

    pub fn interface_recoveries(device: &Device, lines: &[String], at: DateTime<Utc>) -> Self {
        let host = host_label(device);
        let subject = format!("[RESOLVED] {} - {host}", recovery_title(AlertKind::InterfaceStatus));
        Self {
            subject,
            body: interface_body("Recovered interfaces", device, lines, at),
        }
    }
}

fn interface_body(heading: &str, device: &Device, lines: &[String], at: DateTime<Utc>) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "Device:      {}", host_label(device));
    let _ = writeln!(body, "Address:     {}", device.address);
    let _ = writeln!(body, "Timestamp:   {}", stamp(at));
    let _ = writeln!(body, "Count:       {}", lines.len());
    let _ = writeln!(body);
    let _ = writeln!(body, "{heading}:");
    for line in lines {
        let _ = writeln!(body, "  - {line}");
    }
    let _ = writeln!(body);
    body.push_str(FOOTER);
    body
}

#[derive(Debug)]
struct Queued {
    mail: Mail,
    recipients: Vec<String>,
    records: Vec<AlertId>,
}

/// Side effects raised inside a session: mails, and devices whose cached
/// aggregates went stale. They are held until the session commits so
/// delivery outcomes land on records that already exist.
#[derive(Debug, Default)]
pub struct Outbox {
    queued: Vec<Queued>,
    stale_devices: Vec<Ipv4Addr>,
}

impl Outbox {
    pub fn push(&mut self, mail: Mail, recipients: Vec<String>, records: Vec<AlertId>) {
        self.queued.push(Queued {
            mail,
            recipients,
            records,
        });
    }

    pub fn mark_stale(&mut self, address: Ipv4Addr) {
        if !self.stale_devices.contains(&address) {
            self.stale_devices.push(address);
        }
    }

    pub fn stale_devices(&self) -> &[Ipv4Addr] {
        &self.stale_devices
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// Fire-and-forget delivery. Each mail goes out on its own task; the
/// outcome is written back to the alert records in a fresh session.
pub struct Notifier<R: Repository> {
    sink: Arc<dyn NotificationSink>,
    repo: Arc<R>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: Repository> Notifier<R> {
    pub fn new(sink: Arc<dyn NotificationSink>, repo: Arc<R>) -> Self {
        Self {
            sink,
            repo,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, mail: Mail, recipients: Vec<String>, records: Vec<AlertId>) {
        if recipients.is_empty() {
            warn!(subject = %mail.subject, "alert raised but no recipients configured");
            return;
        }

        let sink = Arc::clone(&self.sink);
        let repo = Arc::clone(&self.repo);
        let handle = tokio::spawn(async move {
            let error = match sink.send(&mail.subject, &mail.body, &recipients).await {
                Ok(()) => {
                    info!(subject = %mail.subject, recipients = recipients.len(), "notification sent");
                    None
                }
                Err(err) => {
                    warn!(subject = %mail.subject, error = %err, "notification failed");
                    Some(err.to_string())
                }
            };

            if records.is_empty() {
                return;
            }
            if let Err(err) =
                history::record_dispatch(repo.as_ref(), &records, &recipients, error.as_deref()).await
            {
                warn!(error = %err, records = ?records, "failed to record notification outcome");
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Dispatches everything queued in `outbox`. Call after the session
    /// that raised the mails has committed.
    pub fn release(&self, outbox: Outbox) {
        for queued in outbox.queued {
            self.dispatch(queued.mail, queued.recipients, queued.records);
        }
    }

    pub async fn flush(&self) {
        let pending = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        for task in pending {
            if let Err(err) = task.await {
                warn!(error = %err, "notification task panicked");
            }
        }
    }
}
