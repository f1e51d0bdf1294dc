use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;

use crate::alerts::DeviceCheck;
use crate::commands::{AlertTarget, CommandError, Operator, ThresholdUpdate};
use crate::config::SettingsOverride;
use crate::memory::MemoryStore;
use crate::model::{AlertKind, AlertState, UserAction, OPER_STATUS_UP};
use crate::notify::Outbox;
use crate::oids::Vendor;
use crate::store::{Repository, Session};
use crate::test_support::{at, interface_sample, ip, up_sample, Harness, RecordingCache};

fn operator(harness: &Harness) -> (Operator<MemoryStore>, Arc<RecordingCache>) {
    let cache = Arc::new(RecordingCache::default());
    (Operator::new(harness.store.clone(), cache.clone()), cache)
}

fn trigger_cpu(harness: &Harness, address: Ipv4Addr) {
    let mut device = harness.device(address);
    let mut session = harness.store.begin().expect("begin");
    let mut outbox = Outbox::default();
    harness
        .evaluator
        .evaluate(&mut session, &mut outbox, &mut device, DeviceCheck::Cpu(95.0), Utc::now())
        .expect("evaluate");
    session.save_device(&device).expect("save");
    session.commit().expect("commit");
}

fn cpu(address: Ipv4Addr) -> AlertTarget {
    AlertTarget::Device {
        address,
        kind: AlertKind::Cpu,
    }
}

#[tokio::test]
async fn acknowledge_without_active_alert_is_rejected() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(1), Vendor::Cisco);
    let (operator, _) = operator(&harness);

    // Act
    let result = operator.acknowledge(cpu(ip(1)), "alice", None).await;

    // Assert
    assert!(matches!(result, Err(CommandError::NoActiveAlert(AlertKind::Cpu))));
    assert_eq!(harness.device(ip(1)).cpu_alert.state, AlertState::Clear);
}

#[tokio::test]
async fn acknowledge_records_the_actor_on_the_open_record() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(2), Vendor::Cisco);
    trigger_cpu(&harness, ip(2));
    let (operator, _) = operator(&harness);

    // Act
    let slot = operator
        .acknowledge(cpu(ip(2)), "alice", Some("looking into it"))
        .await
        .expect("acknowledge");

    // Assert
    assert_eq!(slot.state, AlertState::Acknowledged);
    assert!(slot.acknowledged_at.is_some());
    assert_eq!(harness.device(ip(2)).cpu_alert.state, AlertState::Acknowledged);
    let records = operator.alert_history(Some(ip(2))).expect("history");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, Some(UserAction::Acknowledged));
    assert_eq!(records[0].action_by.as_deref(), Some("alice"));
    assert_eq!(records[0].action_notes.as_deref(), Some("looking into it"));
    assert!(records[0].is_open());
}

#[tokio::test]
async fn second_acknowledge_is_rejected() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(3), Vendor::Cisco);
    trigger_cpu(&harness, ip(3));
    let (operator, _) = operator(&harness);
    operator.acknowledge(cpu(ip(3)), "alice", None).await.expect("first");

    // Act
    let second = operator.acknowledge(cpu(ip(3)), "bob", None).await;

    // Assert
    assert!(matches!(second, Err(CommandError::NoActiveAlert(_))));
    let records = operator.alert_history(Some(ip(3))).expect("history");
    assert_eq!(records[0].action_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn resolve_clears_the_slot_and_closes_the_record() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(4), Vendor::Cisco);
    trigger_cpu(&harness, ip(4));
    let (operator, _) = operator(&harness);

    // Act
    let slot = operator.resolve(cpu(ip(4)), "bob", None).await.expect("resolve");

    // Assert
    assert_eq!(slot.state, AlertState::Clear);
    assert!(!slot.alert_sent);
    let records = operator.alert_history(Some(ip(4))).expect("history");
    assert_eq!(records[0].action, Some(UserAction::Resolved));
    assert!(records[0].cleared_at.is_some());
}

#[tokio::test]
async fn resolve_of_a_clear_alert_is_allowed() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(5), Vendor::Cisco);
    let (operator, _) = operator(&harness);

    // Act
    let slot = operator.resolve(cpu(ip(5)), "bob", None).await.expect("resolve");

    // Assert
    assert_eq!(slot.state, AlertState::Clear);
    assert!(operator.alert_history(Some(ip(5))).expect("history").is_empty());
}

#[tokio::test]
async fn interface_alert_can_be_acknowledged() {
    // Arrange
    let harness = Harness::new();
    let mut device = harness.add_device(ip(6), Vendor::Cisco);
    let mut session = harness.store.begin().expect("begin");
    let mut outbox = Outbox::default();
    let (interface, _) = session
        .get_or_create_interface(device.id, 3, "Gi0/3")
        .expect("interface");
    session.append_interface_metric(up_sample(interface.id, at(0))).expect("sample");
    session
        .append_interface_metric(interface_sample(interface.id, at(1), 2, 0, 0))
        .expect("sample");
    harness
        .evaluator
        .evaluate_interfaces(&mut session, &mut outbox, &mut device, at(1))
        .expect("evaluate");
    session.commit().expect("commit");
    let (operator, _) = operator(&harness);

    // Act
    let slot = operator
        .acknowledge(
            AlertTarget::Interface {
                address: ip(6),
                if_index: 3,
                kind: AlertKind::InterfaceStatus,
            },
            "carol",
            None,
        )
        .await
        .expect("acknowledge");

    // Assert
    assert_eq!(slot.state, AlertState::Acknowledged);
    let interfaces = operator.interfaces(ip(6)).expect("interfaces");
    assert_eq!(interfaces[0].status_alert.state, AlertState::Acknowledged);
}

#[tokio::test]
async fn alert_kind_must_match_its_scope() {
    // Arrange
    let harness = Harness::new();
    let device = harness.add_device(ip(7), Vendor::Cisco);
    let mut session = harness.store.begin().expect("begin");
    let (interface, _) = session
        .get_or_create_interface(device.id, 1, "Gi0/1")
        .expect("interface");
    session
        .append_interface_metric(interface_sample(interface.id, at(0), OPER_STATUS_UP, 0, 0))
        .expect("sample");
    session.commit().expect("commit");
    let (operator, _) = operator(&harness);

    // Act
    let on_device = operator
        .resolve(
            AlertTarget::Device {
                address: ip(7),
                kind: AlertKind::PacketDrop,
            },
            "dave",
            None,
        )
        .await;
    let on_interface = operator
        .resolve(
            AlertTarget::Interface {
                address: ip(7),
                if_index: 1,
                kind: AlertKind::Cpu,
            },
            "dave",
            None,
        )
        .await;
    let missing_interface = operator
        .resolve(
            AlertTarget::Interface {
                address: ip(7),
                if_index: 99,
                kind: AlertKind::PacketDrop,
            },
            "dave",
            None,
        )
        .await;

    // Assert
    assert!(matches!(on_device, Err(CommandError::WrongScope { scope: "devices", .. })));
    assert!(matches!(on_interface, Err(CommandError::WrongScope { scope: "interfaces", .. })));
    assert!(matches!(
        missing_interface,
        Err(CommandError::InterfaceNotFound { if_index: 99, .. })
    ));
}

#[tokio::test]
async fn unknown_device_is_reported() {
    // Arrange
    let harness = Harness::new();
    let (operator, _) = operator(&harness);

    // Act
    let result = operator.acknowledge(cpu(ip(200)), "erin", None).await;

    // Assert
    assert!(matches!(result, Err(CommandError::DeviceNotFound(address)) if address == ip(200)));
}

#[tokio::test]
async fn thresholds_are_validated_and_invalidate_cache() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(8), Vendor::Cisco);
    let (operator, cache) = operator(&harness);

    // Act
    let too_high = operator
        .update_thresholds(
            ip(8),
            ThresholdUpdate {
                cpu: Some(101.0),
                ..ThresholdUpdate::default()
            },
        )
        .await;
    let zero_failures = operator
        .update_thresholds(
            ip(8),
            ThresholdUpdate {
                failures: Some(0),
                ..ThresholdUpdate::default()
            },
        )
        .await;
    let updated = operator
        .update_thresholds(
            ip(8),
            ThresholdUpdate {
                cpu: Some(70.0),
                memory: Some(85.0),
                failures: Some(5),
            },
        )
        .await
        .expect("valid update");

    // Assert
    assert!(matches!(too_high, Err(CommandError::InvalidValue(_))));
    assert!(matches!(zero_failures, Err(CommandError::InvalidValue(_))));
    assert_eq!(updated.thresholds.cpu, 70.0);
    assert_eq!(updated.thresholds.memory, 85.0);
    assert_eq!(updated.thresholds.failures, 5);
    assert_eq!(harness.device(ip(8)).thresholds, updated.thresholds);
    assert_eq!(
        cache.keys(),
        vec![
            "device:10.0.0.8".to_string(),
            "network_summary".to_string(),
            "top_devices:*".to_string(),
        ]
    );
}

#[tokio::test]
async fn interface_threshold_must_be_non_negative() {
    // Arrange
    let harness = Harness::new();
    let device = harness.add_device(ip(9), Vendor::Cisco);
    let mut session = harness.store.begin().expect("begin");
    session
        .get_or_create_interface(device.id, 2, "Gi0/2")
        .expect("interface");
    session.commit().expect("commit");
    let (operator, _) = operator(&harness);

    // Act
    let negative = operator.update_interface_threshold(ip(9), 2, -0.5).await;
    let updated = operator
        .update_interface_threshold(ip(9), 2, 2.5)
        .await
        .expect("valid threshold");

    // Assert
    assert!(matches!(negative, Err(CommandError::InvalidValue(_))));
    assert_eq!(updated.packet_drop_threshold, 2.5);
}

#[tokio::test]
async fn maintenance_window_is_bounded() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(10), Vendor::Cisco);
    let (operator, _) = operator(&harness);

    // Act
    let too_long = operator.set_maintenance(ip(10), true, 1_441, None).await;
    let zero = operator.set_maintenance(ip(10), true, 0, None).await;
    let before = Utc::now();
    let enabled = operator
        .set_maintenance(ip(10), true, 90, Some("firmware upgrade"))
        .await
        .expect("enable");
    let disabled = operator
        .set_maintenance(ip(10), false, 0, None)
        .await
        .expect("disable");

    // Assert
    assert!(matches!(too_long, Err(CommandError::InvalidValue(_))));
    assert!(matches!(zero, Err(CommandError::InvalidValue(_))));
    let until = enabled.maintenance.until.expect("window end");
    assert!(until >= before + chrono::Duration::minutes(90));
    assert_eq!(enabled.maintenance.reason.as_deref(), Some("firmware upgrade"));
    assert!(!disabled.maintenance.enabled);
    assert_eq!(disabled.maintenance.until, None);
    assert_eq!(disabled.maintenance.reason, None);
}

#[tokio::test]
async fn recipients_are_validated_and_deduplicated() {
    // Arrange
    let harness = Harness::new();
    let (operator, _) = operator(&harness);

    // Act
    let invalid = operator.add_recipient("not-an-address").await;
    let added = operator.add_recipient(" oncall@example.net ").await.expect("add");
    let duplicate = operator.add_recipient("ONCALL@example.net").await.expect("add");
    let removed = operator.remove_recipient("noc@example.net").await.expect("remove");

    // Assert
    assert!(matches!(invalid, Err(CommandError::InvalidValue(_))));
    assert!(added);
    assert!(!duplicate);
    assert!(removed);
    assert_eq!(operator.recipients().expect("list"), vec!["oncall@example.net".to_string()]);
}

#[tokio::test]
async fn removing_a_device_drops_it_from_the_inventory() {
    // Arrange
    let harness = Harness::new();
    harness.add_device(ip(11), Vendor::Cisco);
    harness.add_device(ip(12), Vendor::Juniper);
    let (operator, cache) = operator(&harness);

    // Act
    operator.remove_device(ip(11)).await.expect("remove");
    let again = operator.remove_device(ip(11)).await;

    // Assert
    let addresses: Vec<_> = operator
        .devices()
        .expect("devices")
        .into_iter()
        .map(|d| d.address)
        .collect();
    assert_eq!(addresses, vec![ip(12)]);
    assert!(matches!(again, Err(CommandError::DeviceNotFound(_))));
    assert!(cache.keys().contains(&"device:10.0.0.11".to_string()));
}

#[tokio::test]
async fn settings_updates_are_merged_into_the_stored_override() {
    // Arrange
    let harness = Harness::new();
    let (operator, _) = operator(&harness);
    operator
        .update_settings(SettingsOverride {
            snmp_community: Some("netops".to_string()),
            ..SettingsOverride::default()
        })
        .await
        .expect("first update");

    // Act
    let merged = operator
        .update_settings(SettingsOverride {
            polling_interval_secs: Some(120),
            ..SettingsOverride::default()
        })
        .await
        .expect("second update");

    // Assert
    assert_eq!(merged.snmp_community.as_deref(), Some("netops"));
    assert_eq!(merged.polling_interval_secs, Some(120));
    let stored = harness
        .store
        .begin()
        .expect("begin")
        .load_settings_override()
        .expect("load");
    assert_eq!(stored, merged);
}
