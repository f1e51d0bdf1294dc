use crate::memory::MemoryStore;
use crate::model::{DeviceMetric, DiscoveredDevice};
use crate::oids::Vendor;
use crate::store::{Repository, Session, StoreError};
use crate::test_support::{at, ip, up_sample};

fn found(address_last: u8, mac: &str) -> DiscoveredDevice {
    DiscoveredDevice {
        address: ip(address_last),
        hostname: format!("edge-{address_last}"),
        mac_address: mac.to_string(),
        vendor: Vendor::Unknown,
    }
}

fn device_metric(device_id: i64, minute: i64, cpu: f64) -> DeviceMetric {
    DeviceMetric {
        device_id,
        timestamp: at(minute),
        cpu_utilization: cpu,
        memory_utilization: 10.0,
        uptime_seconds: 60,
    }
}

#[test]
fn dropped_session_discards_staged_writes() {
    // Arrange
    let store = MemoryStore::new();

    // Act
    {
        let mut session = store.begin().expect("begin");
        session
            .upsert_device_by_mac(&found(1, "aa:aa:aa:aa:aa:01"))
            .expect("upsert");
    }

    // Assert
    let session = store.begin().expect("begin");
    assert!(session.list_devices().expect("list").is_empty());
}

#[test]
fn session_reads_its_own_writes_before_commit() {
    // Arrange
    let store = MemoryStore::new();
    let mut writer = store.begin().expect("begin");
    let reader = store.begin().expect("begin");

    // Act
    let (device, created) = writer
        .upsert_device_by_mac(&found(1, "aa:aa:aa:aa:aa:01"))
        .expect("upsert");

    // Assert
    assert!(created);
    assert!(writer.get_device(device.id).expect("get").is_some());
    assert!(reader.get_device(device.id).expect("get").is_none());
}

#[test]
fn commit_reports_busy_and_keeps_staged_writes() {
    // Arrange
    let store = MemoryStore::new();
    let mut session = store.begin().expect("begin");
    session.add_recipient("ops@example.net").expect("add");

    // Act
    let guard = store.lock().expect("lock");
    let busy = session.commit();
    drop(guard);
    let retried = session.commit();

    // Assert
    assert!(matches!(busy, Err(StoreError::Busy)));
    assert!(retried.is_ok());
    let recipients = store.begin().expect("begin").list_recipients().expect("list");
    assert_eq!(recipients, vec!["ops@example.net".to_string()]);
}

#[test]
fn upsert_matches_on_mac_and_follows_address_change() {
    // Arrange
    let store = MemoryStore::new();
    let mut session = store.begin().expect("begin");
    let (original, _) = session
        .upsert_device_by_mac(&found(1, "aa:aa:aa:aa:aa:01"))
        .expect("upsert");
    session.commit().expect("commit");

    // Act
    let mut session = store.begin().expect("begin");
    let (moved, created) = session
        .upsert_device_by_mac(&found(7, "aa:aa:aa:aa:aa:01"))
        .expect("upsert");
    session.commit().expect("commit");

    // Assert
    assert!(!created);
    assert_eq!(moved.id, original.id);
    assert_eq!(moved.address, ip(7));
    let devices = store.begin().expect("begin").list_devices().expect("list");
    assert_eq!(devices.len(), 1);
}

#[test]
fn upsert_without_mac_matches_on_address() {
    // Arrange
    let store = MemoryStore::new();
    let mut session = store.begin().expect("begin");
    let (first, _) = session.upsert_device_by_mac(&found(3, "")).expect("upsert");

    // Act
    let (second, created) = session.upsert_device_by_mac(&found(3, "")).expect("upsert");
    session.commit().expect("commit");

    // Assert
    assert!(!created);
    assert_eq!(first.id, second.id);
}

#[test]
fn commit_rejects_duplicate_addresses() {
    // Arrange
    let store = MemoryStore::new();
    let mut first = store.begin().expect("begin");
    let mut second = store.begin().expect("begin");
    first
        .upsert_device_by_mac(&found(4, "aa:aa:aa:aa:aa:04"))
        .expect("upsert");
    second
        .upsert_device_by_mac(&found(4, "bb:bb:bb:bb:bb:04"))
        .expect("upsert");
    first.commit().expect("commit");

    // Act
    let result = second.commit();

    // Assert
    assert!(matches!(result, Err(StoreError::Constraint(_))));
    assert_eq!(store.begin().expect("begin").list_devices().expect("list").len(), 1);
}

#[test]
fn recent_metrics_are_newest_first_across_committed_and_staged() {
    // Arrange
    let store = MemoryStore::new();
    let mut session = store.begin().expect("begin");
    let (device, _) = session
        .upsert_device_by_mac(&found(5, "aa:aa:aa:aa:aa:05"))
        .expect("upsert");
    session.append_device_metric(device_metric(device.id, 0, 1.0)).expect("append");
    session.append_device_metric(device_metric(device.id, 1, 2.0)).expect("append");
    session.commit().expect("commit");
    let mut session = store.begin().expect("begin");
    session.append_device_metric(device_metric(device.id, 2, 3.0)).expect("append");

    // Act
    let recent = session.recent_device_metrics(device.id, 2).expect("recent");

    // Assert
    let cpu: Vec<f64> = recent.iter().map(|m| m.cpu_utilization).collect();
    assert_eq!(cpu, vec![3.0, 2.0]);
}

#[test]
fn metric_series_are_capped() {
    // Arrange
    let store = MemoryStore::with_capacity(3);
    let mut session = store.begin().expect("begin");
    let (device, _) = session
        .upsert_device_by_mac(&found(6, "aa:aa:aa:aa:aa:06"))
        .expect("upsert");
    for minute in 0..5 {
        session
            .append_device_metric(device_metric(device.id, minute, minute as f64))
            .expect("append");
    }

    // Act
    session.commit().expect("commit");

    // Assert
    let recent = store
        .begin()
        .expect("begin")
        .recent_device_metrics(device.id, 10)
        .expect("recent");
    let cpu: Vec<f64> = recent.iter().map(|m| m.cpu_utilization).collect();
    assert_eq!(cpu, vec![4.0, 3.0, 2.0]);
}

#[test]
fn deleting_a_device_cascades_to_interfaces_and_samples() {
    // Arrange
    let store = MemoryStore::new();
    let mut session = store.begin().expect("begin");
    let (device, _) = session
        .upsert_device_by_mac(&found(8, "aa:aa:aa:aa:aa:08"))
        .expect("upsert");
    let (interface, _) = session
        .get_or_create_interface(device.id, 1, "eth0")
        .expect("interface");
    session.append_interface_metric(up_sample(interface.id, at(0))).expect("append");
    session.commit().expect("commit");

    // Act
    let mut session = store.begin().expect("begin");
    session.delete_device(device.id).expect("delete");
    session.commit().expect("commit");

    // Assert
    let session = store.begin().expect("begin");
    assert!(session.get_device(device.id).expect("get").is_none());
    assert!(session.list_interfaces(device.id).expect("list").is_empty());
    assert!(session
        .recent_interface_metrics(interface.id, 5)
        .expect("recent")
        .is_empty());
}

#[test]
fn interface_requires_an_existing_device() {
    // Arrange
    let store = MemoryStore::new();
    let mut session = store.begin().expect("begin");

    // Act
    let result = session.get_or_create_interface(999, 1, "eth0");

    // Assert
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}
