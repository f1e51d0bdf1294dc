use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::alerts::AlertEvaluator;
use crate::cache::CacheInvalidator;
use crate::config::{Settings, StaticConfig};
use crate::memory::MemoryStore;
use crate::model::{Device, DiscoveredDevice, InterfaceCounters, InterfaceMetric, OPER_STATUS_UP};
use crate::notify::{NotificationSink, Notifier, NotifyError};
use crate::oids::{if_mib, Vendor, SYS_NAME, SYS_OBJECT_ID, SYS_UPTIME, IF_PHYS_ADDRESS_1};
use crate::poller::Poller;
use crate::snmp::{SnmpClient, SnmpError, SnmpTarget, SnmpValue, WalkRow, WalkTable};
use crate::store::{Repository, Session};

pub const RECIPIENT: &str = "noc@example.net";

pub fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

pub fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid date")
        + Duration::minutes(minute)
}

#[derive(Debug, Clone, Default)]
pub struct FakeAgent {
    pub values: HashMap<String, SnmpValue>,
    pub table: WalkTable,
    pub failing: bool,
}

impl FakeAgent {
    pub fn named(hostname: &str) -> Self {
        let mut agent = Self::default();
        agent.set(SYS_NAME, SnmpValue::Bytes(hostname.as_bytes().to_vec()));
        agent.set(SYS_UPTIME, SnmpValue::Ticks(360_000));
        agent
    }

    pub fn set(&mut self, oid: &str, value: SnmpValue) {
        self.values.insert(oid.to_string(), value);
    }

    pub fn with_identity(mut self, mac: [u8; 6], sys_object_id: &str) -> Self {
        self.set(IF_PHYS_ADDRESS_1, SnmpValue::Bytes(mac.to_vec()));
        self.set(SYS_OBJECT_ID, SnmpValue::Oid(sys_object_id.to_string()));
        self
    }

    pub fn with_cisco_health(mut self, cpu: u64, used: u64, free: u64) -> Self {
        let oids = Vendor::Cisco.health_oids();
        self.set(oids[0], SnmpValue::Integer(cpu as i64));
        self.set(oids[1], SnmpValue::Counter(used));
        self.set(oids[2], SnmpValue::Counter(free));
        self
    }

    pub fn with_interface(mut self, if_index: u32, row: WalkRow) -> Self {
        self.table.insert(if_index, row);
        self
    }
}

pub fn interface_row(name: &str, oper_status: i64, high_speed_mbps: u64) -> WalkRow {
    let mut row = WalkRow::new();
    row.insert(if_mib::DESCR.to_string(), SnmpValue::Bytes(name.as_bytes().to_vec()));
    row.insert(if_mib::ADMIN_STATUS.to_string(), SnmpValue::Integer(1));
    row.insert(if_mib::OPER_STATUS.to_string(), SnmpValue::Integer(oper_status));
    row.insert(if_mib::HIGH_SPEED.to_string(), SnmpValue::Counter(high_speed_mbps));
    row.insert(if_mib::HC_IN_OCTETS.to_string(), SnmpValue::Counter(1_000));
    row.insert(if_mib::HC_OUT_OCTETS.to_string(), SnmpValue::Counter(2_000));
    row.insert(if_mib::HC_IN_UCAST_PKTS.to_string(), SnmpValue::Counter(10));
    row.insert(if_mib::HC_OUT_UCAST_PKTS.to_string(), SnmpValue::Counter(20));
    row
}

/// Scripted SNMP agents keyed by address. Unknown hosts time out.
#[derive(Debug, Default)]
pub struct FakeSnmp {
    agents: Mutex<HashMap<Ipv4Addr, FakeAgent>>,
}

impl FakeSnmp {
    pub fn set(&self, host: Ipv4Addr, agent: FakeAgent) {
        self.agents.lock().expect("agents lock").insert(host, agent);
    }

    pub fn update(&self, host: Ipv4Addr, change: impl FnOnce(&mut FakeAgent)) {
        let mut agents = self.agents.lock().expect("agents lock");
        change(agents.entry(host).or_default());
    }

    fn agent(&self, host: Ipv4Addr) -> Result<FakeAgent, SnmpError> {
        match self.agents.lock().expect("agents lock").get(&host) {
            Some(agent) if !agent.failing => Ok(agent.clone()),
            _ => Err(SnmpError::Timeout),
        }
    }
}

#[async_trait]
impl SnmpClient for FakeSnmp {
    async fn get(&self, target: &SnmpTarget, oids: &[&str]) -> Result<Vec<SnmpValue>, SnmpError> {
        let agent = self.agent(target.host)?;
        Ok(oids
            .iter()
            .map(|oid| agent.values.get(*oid).cloned().unwrap_or(SnmpValue::Missing))
            .collect())
    }

    async fn bulk_walk(&self, target: &SnmpTarget, _oids: &[&str]) -> Result<WalkTable, SnmpError> {
        Ok(self.agent(target.host)?.table)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SentMail>>,
    failure: Mutex<Option<NotifyError>>,
}

impl RecordingSink {
    pub fn fail_with(&self, error: NotifyError) {
        *self.failure.lock().expect("failure lock") = Some(error);
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.subject).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<(), NotifyError> {
        if let Some(error) = self.failure.lock().expect("failure lock").clone() {
            return Err(error);
        }
        self.sent.lock().expect("sent lock").push(SentMail {
            subject: subject.to_string(),
            body: body.to_string(),
            recipients: recipients.to_vec(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingCache {
    keys: Mutex<Vec<String>>,
}

impl RecordingCache {
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().expect("keys lock").clone()
    }
}

impl CacheInvalidator for RecordingCache {
    fn invalidate(&self, key: &str) {
        self.keys.lock().expect("keys lock").push(key.to_string());
    }

    fn invalidate_prefix(&self, prefix: &str) {
        self.keys.lock().expect("keys lock").push(format!("{prefix}*"));
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub snmp: Arc<FakeSnmp>,
    pub sink: Arc<RecordingSink>,
    pub notifier: Arc<Notifier<MemoryStore>>,
    pub evaluator: AlertEvaluator<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let snmp = Arc::new(FakeSnmp::default());
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(Notifier::new(sink.clone(), store.clone()));
        let evaluator = AlertEvaluator::new(notifier.clone());

        let mut session = store.begin().expect("begin");
        session.add_recipient(RECIPIENT).expect("add recipient");
        session.commit().expect("commit");

        Self {
            store,
            snmp,
            sink,
            notifier,
            evaluator,
        }
    }

    pub fn poller(&self) -> Poller<MemoryStore> {
        Poller::new(
            self.snmp.clone(),
            self.store.clone(),
            Arc::new(StaticConfig(Settings::default())),
            self.evaluator.clone(),
        )
    }

    pub fn add_device(&self, address: Ipv4Addr, vendor: Vendor) -> Device {
        let mut session = self.store.begin().expect("begin");
        let (device, _) = session
            .upsert_device_by_mac(&DiscoveredDevice {
                address,
                hostname: format!("sw-{}", address.octets()[3]),
                mac_address: format!("00:11:22:33:44:{:02x}", address.octets()[3]),
                vendor,
            })
            .expect("upsert");
        session.commit().expect("commit");
        device
    }

    pub fn device(&self, address: Ipv4Addr) -> Device {
        self.store
            .begin()
            .expect("begin")
            .get_device_by_address(address)
            .expect("lookup")
            .expect("device exists")
    }
}

pub fn interface_sample(
    interface_id: i64,
    timestamp: DateTime<Utc>,
    oper_status: i64,
    packets: u64,
    discards: u64,
) -> InterfaceMetric {
    InterfaceMetric {
        interface_id,
        timestamp,
        admin_status: 1,
        oper_status,
        counters: InterfaceCounters {
            packets_in: packets,
            discards_in: discards,
            ..InterfaceCounters::default()
        },
    }
}

pub fn up_sample(interface_id: i64, timestamp: DateTime<Utc>) -> InterfaceMetric {
    interface_sample(interface_id, timestamp, OPER_STATUS_UP, 0, 0)
}
