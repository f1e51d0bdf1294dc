use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snmp2::{AsyncSession, Oid, Value};
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Settings;

pub const SNMP_PORT: u16 = 161;
const DEFAULT_MAX_REPETITIONS: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnmpValue {
    Integer(i64),
    Counter(u64),
    Ticks(u32),
    Bytes(Vec<u8>),
    Oid(String),
    IpAddress(Ipv4Addr),
    /// noSuchObject, noSuchInstance, endOfMibView or null.
    Missing,
}

impl SnmpValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SnmpValue::Integer(v) => u64::try_from(*v).ok(),
            SnmpValue::Counter(v) => Some(*v),
            SnmpValue::Ticks(v) => Some(u64::from(*v)),
            SnmpValue::Bytes(_) => self.as_text().and_then(|t| t.parse().ok()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SnmpValue::Integer(v) => Some(*v),
            SnmpValue::Counter(v) => i64::try_from(*v).ok(),
            SnmpValue::Ticks(v) => Some(i64::from(*v)),
            SnmpValue::Bytes(_) => self.as_text().and_then(|t| t.parse().ok()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SnmpValue::Integer(v) => Some(*v as f64),
            SnmpValue::Counter(v) => Some(*v as f64),
            SnmpValue::Ticks(v) => Some(f64::from(*v)),
            SnmpValue::Bytes(_) => self.as_text().and_then(|t| t.parse().ok()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            SnmpValue::Bytes(bytes) => {
                let text = String::from_utf8_lossy(bytes).trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            SnmpValue::Oid(oid) => Some(oid.clone()),
            SnmpValue::Integer(v) => Some(v.to_string()),
            SnmpValue::Counter(v) => Some(v.to_string()),
            SnmpValue::Ticks(v) => Some(v.to_string()),
            SnmpValue::IpAddress(ip) => Some(ip.to_string()),
            SnmpValue::Missing => None,
        }
    }

    pub fn as_mac(&self) -> Option<String> {
        match self {
            SnmpValue::Bytes(bytes) if bytes.len() == 6 && bytes.iter().any(|b| *b != 0) => Some(
                bytes
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":"),
            ),
            _ => None,
        }
    }

    fn from_wire(value: &Value<'_>) -> Self {
        match value {
            Value::Integer(v) => SnmpValue::Integer(*v),
            Value::Counter32(v) | Value::Unsigned32(v) => SnmpValue::Counter(u64::from(*v)),
            Value::Counter64(v) => SnmpValue::Counter(*v),
            Value::Timeticks(v) => SnmpValue::Ticks(*v),
            Value::OctetString(bytes) => SnmpValue::Bytes(bytes.to_vec()),
            Value::ObjectIdentifier(oid) => match oid_arcs(oid) {
                Some(arcs) => SnmpValue::Oid(format_oid(&arcs)),
                None => SnmpValue::Missing,
            },
            Value::IpAddress(octets) => SnmpValue::IpAddress(Ipv4Addr::from(*octets)),
            _ => SnmpValue::Missing,
        }
    }
}

pub type WalkRow = BTreeMap<String, SnmpValue>;

pub type WalkTable = BTreeMap<u32, WalkRow>;

#[derive(Debug, Clone, PartialEq)]
pub struct SnmpTarget {
    pub host: Ipv4Addr,
    pub port: u16,
    pub community: String,
    pub timeout: Duration,
    pub retries: u32,
}

impl SnmpTarget {
    pub fn new(host: Ipv4Addr, settings: &Settings) -> Self {
        Self {
            host,
            port: SNMP_PORT,
            community: settings.snmp_community.clone(),
            timeout: settings.snmp_timeout(),
            retries: settings.snmp_retries,
        }
    }
}

/// Every transport failure collapses into this type. Callers treat any
/// variant as "poll failed"; the variant survives for logging only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SnmpError {
    #[error("timeout")]
    Timeout,
    #[error("io error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("agent returned error-status {status} at index {index}")]
    ErrorStatus { status: u32, index: u32 },
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait SnmpClient: Send + Sync {
    async fn get(&self, target: &SnmpTarget, oids: &[&str]) -> Result<Vec<SnmpValue>, SnmpError>;

    async fn bulk_walk(&self, target: &SnmpTarget, oids: &[&str]) -> Result<WalkTable, SnmpError>;
}

pub fn parse_oid(oid: &str) -> Result<Vec<u64>, SnmpError> {
    oid.trim()
        .trim_start_matches('.')
        .split('.')
        .map(|arc| {
            arc.parse::<u64>()
                .map_err(|_| SnmpError::Malformed(format!("invalid oid {oid}")))
        })
        .collect()
}

pub fn format_oid(arcs: &[u64]) -> String {
    arcs.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn oid_arcs(oid: &Oid<'_>) -> Option<Vec<u64>> {
    oid.iter().map(|arcs| arcs.collect())
}

fn to_wire_oid(arcs: &[u64]) -> Result<Oid<'static>, SnmpError> {
    Oid::from(arcs).map_err(|_| SnmpError::Malformed(format!("unencodable oid {}", format_oid(arcs))))
}

/// Bookkeeping for a multi-column bulk walk. Each base column advances its
/// own cursor until a returned OID leaves its subtree.
#[derive(Debug)]
pub(crate) struct WalkCursor {
    bases: Vec<(Vec<u64>, String)>,
    cursors: Vec<Vec<u64>>,
    active: Vec<usize>,
    table: WalkTable,
}

impl WalkCursor {
    pub(crate) fn new(oids: &[&str]) -> Result<Self, SnmpError> {
        let mut bases = Vec::with_capacity(oids.len());
        for oid in oids {
            let arcs = parse_oid(oid)?;
            let key = format_oid(&arcs);
            bases.push((arcs, key));
        }
        let cursors = bases.iter().map(|(arcs, _)| arcs.clone()).collect();
        let active = (0..bases.len()).collect();

        Ok(Self {
            bases,
            cursors,
            active,
            table: WalkTable::new(),
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn pending(&self) -> Vec<Vec<u64>> {
        self.active.iter().map(|&i| self.cursors[i].clone()).collect()
    }

    /// Consumes one GETBULK response. Varbinds arrive row by row, one per
    /// requested column, so position modulo the request width names the
    /// column.
    pub(crate) fn absorb(&mut self, varbinds: Vec<(Vec<u64>, SnmpValue)>) {
        let width = self.active.len();
        if width == 0 {
            return;
        }
        if varbinds.is_empty() {
            self.active.clear();
            return;
        }

        let mut finished = vec![false; self.bases.len()];
        for (position, (oid, value)) in varbinds.into_iter().enumerate() {
            let column = self.active[position % width];
            if finished[column] {
                continue;
            }

            let (base, base_key) = &self.bases[column];
            let in_subtree = oid.len() > base.len() && oid.starts_with(base);
            let advanced = oid > self.cursors[column];
            if !in_subtree || !advanced || value == SnmpValue::Missing {
                finished[column] = true;
                continue;
            }

            let Some(index) = oid.last().and_then(|i| u32::try_from(*i).ok()) else {
                finished[column] = true;
                continue;
            };
            self.table
                .entry(index)
                .or_default()
                .insert(base_key.clone(), value);
            self.cursors[column] = oid;
        }

        self.active.retain(|column| !finished[*column]);
    }

    pub(crate) fn into_table(self) -> WalkTable {
        self.table
    }
}

#[derive(Debug, Clone)]
pub struct Snmp2Client {
    max_repetitions: u32,
}

impl Default for Snmp2Client {
    fn default() -> Self {
        Self {
            max_repetitions: DEFAULT_MAX_REPETITIONS,
        }
    }
}

impl Snmp2Client {
    pub fn new(max_repetitions: u32) -> Self {
        Self {
            max_repetitions: max_repetitions.max(1),
        }
    }

    async fn open(target: &SnmpTarget) -> Result<AsyncSession, SnmpError> {
        let addr = SocketAddr::from((target.host, target.port));
        timeout(
            target.timeout,
            AsyncSession::new_v2c(addr, target.community.as_bytes(), 0),
        )
        .await
        .map_err(|_| SnmpError::Timeout)?
        .map_err(|err| SnmpError::Io(err.to_string()))
    }

    async fn get_one(
        session: &mut AsyncSession,
        target: &SnmpTarget,
        oid: &str,
    ) -> Result<SnmpValue, SnmpError> {
        let wire = to_wire_oid(&parse_oid(oid)?)?;
        let mut last_error = SnmpError::Timeout;

        for attempt in 0..=target.retries {
            match timeout(target.timeout, session.get(&wire)).await {
                Err(_) => last_error = SnmpError::Timeout,
                Ok(Err(err)) => last_error = SnmpError::Protocol(format!("{err:?}")),
                Ok(Ok(mut pdu)) => {
                    if pdu.error_status != 0 {
                        return Err(SnmpError::ErrorStatus {
                            status: pdu.error_status,
                            index: pdu.error_index,
                        });
                    }
                    return match pdu.varbinds.next() {
                        Some((_, value)) => Ok(SnmpValue::from_wire(&value)),
                        None => Err(SnmpError::Malformed("empty varbind list".to_string())),
                    };
                }
            }
            debug!(host = %target.host, oid, attempt, error = %last_error, "snmp get attempt failed");
        }

        Err(last_error)
    }

    async fn get_bulk(
        &self,
        session: &mut AsyncSession,
        target: &SnmpTarget,
        cursors: &[Vec<u64>],
    ) -> Result<Vec<(Vec<u64>, SnmpValue)>, SnmpError> {
        let wire = cursors
            .iter()
            .map(|arcs| to_wire_oid(arcs))
            .collect::<Result<Vec<_>, _>>()?;
        let refs = wire.iter().collect::<Vec<_>>();
        let mut last_error = SnmpError::Timeout;

        for attempt in 0..=target.retries {
            match timeout(target.timeout, session.getbulk(&refs, 0, self.max_repetitions)).await {
                Err(_) => last_error = SnmpError::Timeout,
                Ok(Err(err)) => last_error = SnmpError::Protocol(format!("{err:?}")),
                Ok(Ok(pdu)) => {
                    if pdu.error_status != 0 {
                        return Err(SnmpError::ErrorStatus {
                            status: pdu.error_status,
                            index: pdu.error_index,
                        });
                    }
                    let mut varbinds = Vec::new();
                    for (oid, value) in pdu.varbinds {
                        let arcs = oid_arcs(&oid)
                            .ok_or_else(|| SnmpError::Malformed("oid arc overflow".to_string()))?;
                        varbinds.push((arcs, SnmpValue::from_wire(&value)));
                    }
                    return Ok(varbinds);
                }
            }
            debug!(host = %target.host, attempt, error = %last_error, "snmp getbulk attempt failed");
        }

        Err(last_error)
    }
}

#[async_trait]
impl SnmpClient for Snmp2Client {
    async fn get(&self, target: &SnmpTarget, oids: &[&str]) -> Result<Vec<SnmpValue>, SnmpError> {
        let mut session = Self::open(target).await?;
        let mut values = Vec::with_capacity(oids.len());
        for oid in oids {
            values.push(Self::get_one(&mut session, target, oid).await?);
        }
        Ok(values)
    }

    async fn bulk_walk(&self, target: &SnmpTarget, oids: &[&str]) -> Result<WalkTable, SnmpError> {
        let mut session = Self::open(target).await?;
        let mut walk = WalkCursor::new(oids)?;

        while !walk.is_done() {
            let pending = walk.pending();
            let varbinds = self.get_bulk(&mut session, target, &pending).await?;
            walk.absorb(varbinds);
        }

        Ok(walk.into_table())
    }
}
