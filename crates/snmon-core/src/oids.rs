use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::snmp::SnmpValue;

pub const SYS_OBJECT_ID: &str = "1.3.6.1.2.1.1.2.0";
pub const SYS_UPTIME: &str = "1.3.6.1.2.1.1.3.0";
pub const SYS_NAME: &str = "1.3.6.1.2.1.1.5.0";
pub const IF_PHYS_ADDRESS_1: &str = "1.3.6.1.2.1.2.2.1.6.1";
pub const ENT_PHYSICAL_MODEL_NAME_1: &str = "1.3.6.1.2.1.47.1.1.1.1.13.1";

const ENTERPRISES: &str = "1.3.6.1.4.1.";

pub const DISCOVERY_OIDS: [&str; 3] = [SYS_NAME, IF_PHYS_ADDRESS_1, SYS_OBJECT_ID];

pub const DEVICE_OIDS: [&str; 3] = [SYS_UPTIME, SYS_NAME, ENT_PHYSICAL_MODEL_NAME_1];

pub mod if_mib {
    pub const DESCR: &str = "1.3.6.1.2.1.2.2.1.2";
    pub const SPEED: &str = "1.3.6.1.2.1.2.2.1.5";
    pub const ADMIN_STATUS: &str = "1.3.6.1.2.1.2.2.1.7";
    pub const OPER_STATUS: &str = "1.3.6.1.2.1.2.2.1.8";
    pub const IN_OCTETS: &str = "1.3.6.1.2.1.2.2.1.10";
    pub const IN_UCAST_PKTS: &str = "1.3.6.1.2.1.2.2.1.11";
    pub const IN_NUCAST_PKTS: &str = "1.3.6.1.2.1.2.2.1.12";
    pub const IN_DISCARDS: &str = "1.3.6.1.2.1.2.2.1.13";
    pub const IN_ERRORS: &str = "1.3.6.1.2.1.2.2.1.14";
    pub const OUT_OCTETS: &str = "1.3.6.1.2.1.2.2.1.16";
    pub const OUT_UCAST_PKTS: &str = "1.3.6.1.2.1.2.2.1.17";
    pub const OUT_NUCAST_PKTS: &str = "1.3.6.1.2.1.2.2.1.18";
    pub const OUT_DISCARDS: &str = "1.3.6.1.2.1.2.2.1.19";
    pub const OUT_ERRORS: &str = "1.3.6.1.2.1.2.2.1.20";

    pub const HC_IN_OCTETS: &str = "1.3.6.1.2.1.31.1.1.1.6";
    pub const HC_IN_UCAST_PKTS: &str = "1.3.6.1.2.1.31.1.1.1.7";
    pub const HC_IN_MULTICAST_PKTS: &str = "1.3.6.1.2.1.31.1.1.1.8";
    pub const HC_IN_BROADCAST_PKTS: &str = "1.3.6.1.2.1.31.1.1.1.9";
    pub const HC_OUT_OCTETS: &str = "1.3.6.1.2.1.31.1.1.1.10";
    pub const HC_OUT_UCAST_PKTS: &str = "1.3.6.1.2.1.31.1.1.1.11";
    pub const HC_OUT_MULTICAST_PKTS: &str = "1.3.6.1.2.1.31.1.1.1.12";
    pub const HC_OUT_BROADCAST_PKTS: &str = "1.3.6.1.2.1.31.1.1.1.13";
    pub const HIGH_SPEED: &str = "1.3.6.1.2.1.31.1.1.1.15";

    pub const WALK: [&str; 23] = [
        DESCR,
        SPEED,
        ADMIN_STATUS,
        OPER_STATUS,
        IN_OCTETS,
        IN_UCAST_PKTS,
        IN_NUCAST_PKTS,
        IN_DISCARDS,
        IN_ERRORS,
        OUT_OCTETS,
        OUT_UCAST_PKTS,
        OUT_NUCAST_PKTS,
        OUT_DISCARDS,
        OUT_ERRORS,
        HC_IN_OCTETS,
        HC_IN_UCAST_PKTS,
        HC_IN_MULTICAST_PKTS,
        HC_IN_BROADCAST_PKTS,
        HC_OUT_OCTETS,
        HC_OUT_UCAST_PKTS,
        HC_OUT_MULTICAST_PKTS,
        HC_OUT_BROADCAST_PKTS,
        HIGH_SPEED,
    ];
}

mod cisco {
    pub const CPU_TOTAL_5MIN: &str = "1.3.6.1.4.1.9.9.109.1.1.1.1.5.1";
    pub const MEMORY_POOL_USED: &str = "1.3.6.1.4.1.9.9.48.1.1.1.5.1";
    pub const MEMORY_POOL_FREE: &str = "1.3.6.1.4.1.9.9.48.1.1.1.6.1";
}

mod juniper {
    pub const OPERATING_CPU: &str = "1.3.6.1.4.1.2636.3.1.13.1.8.9.1.0.0";
    pub const OPERATING_BUFFER: &str = "1.3.6.1.4.1.2636.3.1.13.1.11.9.1.0.0";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    Cisco,
    Hp,
    ThreeCom,
    Juniper,
    NetSnmp,
    Microsoft,
    UcdSnmp,
    Dell,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Health {
    pub cpu: f64,
    pub memory: f64,
}

impl Vendor {
    pub fn from_sys_object_id(oid: &str) -> Self {
        let oid = oid.trim().trim_start_matches('.');
        let Some(rest) = oid.strip_prefix(ENTERPRISES) else {
            return Vendor::Unknown;
        };
        let enterprise = rest.split('.').next().and_then(|n| n.parse::<u32>().ok());

        match enterprise {
            Some(9) => Vendor::Cisco,
            Some(11) => Vendor::Hp,
            Some(43) => Vendor::ThreeCom,
            Some(2636) => Vendor::Juniper,
            Some(8072) => Vendor::NetSnmp,
            Some(311) => Vendor::Microsoft,
            Some(2021) => Vendor::UcdSnmp,
            Some(674) => Vendor::Dell,
            _ => Vendor::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Vendor::Cisco => "Cisco",
            Vendor::Hp => "HP",
            Vendor::ThreeCom => "3Com",
            Vendor::Juniper => "Juniper",
            Vendor::NetSnmp => "Net-SNMP",
            Vendor::Microsoft => "Microsoft",
            Vendor::UcdSnmp => "UCD-SNMP",
            Vendor::Dell => "Dell",
            Vendor::Unknown => "Unknown",
        }
    }

    pub fn health_oids(self) -> &'static [&'static str] {
        match self {
            Vendor::Cisco => &[
                cisco::CPU_TOTAL_5MIN,
                cisco::MEMORY_POOL_USED,
                cisco::MEMORY_POOL_FREE,
            ],
            Vendor::Juniper => &[juniper::OPERATING_CPU, juniper::OPERATING_BUFFER],
            _ => &[],
        }
    }

    pub fn health(self, values: &HashMap<&str, SnmpValue>) -> Health {
        let number = |oid: &str| values.get(oid).and_then(SnmpValue::as_f64).unwrap_or(0.0);

        match self {
            Vendor::Cisco => {
                let used = number(cisco::MEMORY_POOL_USED);
                let free = number(cisco::MEMORY_POOL_FREE);
                let total = used + free;
                Health {
                    cpu: number(cisco::CPU_TOTAL_5MIN),
                    memory: if total > 0.0 { used / total * 100.0 } else { 0.0 },
                }
            }
            Vendor::Juniper => Health {
                cpu: number(juniper::OPERATING_CPU),
                memory: number(juniper::OPERATING_BUFFER),
            },
            _ => Health::default(),
        }
    }
}
