pub mod alerts;
pub mod cache;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod discovery;
pub mod history;
pub mod memory;
pub mod model;
pub mod notify;
pub mod oids;
pub mod poller;
pub mod snmp;
pub mod sqlite;
pub mod store;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod commands_tests;
#[cfg(test)]
mod coordinator_tests;
#[cfg(test)]
mod counters_tests;
#[cfg(test)]
mod memory_tests;
#[cfg(test)]
mod snmp_tests;

pub use alerts::{AlertEvaluator, DeviceCheck, Transition};
pub use cache::{CacheInvalidator, NoopCache};
pub use commands::{AlertTarget, CommandError, Operator, ThresholdUpdate};
pub use config::{ConfigProvider, Settings, SettingsOverride, StaticConfig, StoreConfig};
pub use coordinator::{PollConflict, PollCoordinator, PollKind, PollLease, PollStatus};
pub use discovery::{Discovery, DiscoveryError, DiscoverySummary};
pub use memory::MemoryStore;
pub use model::{AlertKind, AlertRecord, AlertState, Device, Interface};
pub use notify::{Mail, NotificationSink, Notifier, NotifyError, Outbox};
pub use poller::{PollSummary, Poller};
pub use snmp::{Snmp2Client, SnmpClient, SnmpError, SnmpTarget, SnmpValue};
pub use sqlite::{SqlitePollLease, SqliteStore, DEFAULT_LEASE_TTL};
pub use store::{Repository, Session, StoreError};
