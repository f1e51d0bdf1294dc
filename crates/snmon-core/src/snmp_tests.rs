use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::Settings;
use crate::oids::Vendor;
use crate::snmp::{format_oid, parse_oid, SnmpTarget, SnmpValue, WalkCursor};

const DESCR: &str = "1.3.6.1.2.1.2.2.1.2";
const OPER: &str = "1.3.6.1.2.1.2.2.1.8";

fn arcs(oid: &str) -> Vec<u64> {
    parse_oid(oid).expect("valid oid")
}

fn text(value: &str) -> SnmpValue {
    SnmpValue::Bytes(value.as_bytes().to_vec())
}

#[test]
fn parse_oid_accepts_leading_dot_and_rejects_garbage() {
    assert_eq!(parse_oid(".1.3.6.1").expect("parses"), vec![1, 3, 6, 1]);
    assert_eq!(format_oid(&[1, 3, 6, 1, 2]), "1.3.6.1.2");
    assert!(parse_oid("1.3.x.1").is_err());
    assert!(parse_oid("").is_err());
}

#[test]
fn walk_merges_columns_by_index_and_stops_at_subtree_end() {
    // Arrange
    let mut cursor = WalkCursor::new(&[DESCR, OPER]).expect("cursor");
    let first = vec![
        (arcs("1.3.6.1.2.1.2.2.1.2.1"), text("Gi0/1")),
        (arcs("1.3.6.1.2.1.2.2.1.8.1"), SnmpValue::Integer(1)),
        (arcs("1.3.6.1.2.1.2.2.1.2.2"), text("Gi0/2")),
        (arcs("1.3.6.1.2.1.2.2.1.8.2"), SnmpValue::Integer(2)),
    ];
    let second = vec![
        (arcs("1.3.6.1.2.1.2.2.1.3.1"), SnmpValue::Integer(6)),
        (arcs("1.3.6.1.2.1.2.2.1.9.1"), SnmpValue::Ticks(0)),
    ];

    // Act
    cursor.absorb(first);
    let pending = cursor.pending();
    cursor.absorb(second);

    // Assert
    assert_eq!(
        pending,
        vec![arcs("1.3.6.1.2.1.2.2.1.2.2"), arcs("1.3.6.1.2.1.2.2.1.8.2")]
    );
    assert!(cursor.is_done());
    let table = cursor.into_table();
    assert_eq!(table.len(), 2);
    assert_eq!(table[&1][DESCR], text("Gi0/1"));
    assert_eq!(table[&2][OPER], SnmpValue::Integer(2));
}

#[test]
fn walk_keeps_going_for_columns_that_are_not_finished() {
    // Arrange
    let mut cursor = WalkCursor::new(&[DESCR, OPER]).expect("cursor");

    // Act
    cursor.absorb(vec![
        (arcs("1.3.6.1.2.1.2.2.1.2.1"), text("eth0")),
        (arcs("1.3.6.1.2.1.2.2.1.9.1"), SnmpValue::Ticks(0)),
    ]);

    // Assert
    assert!(!cursor.is_done());
    assert_eq!(cursor.pending(), vec![arcs("1.3.6.1.2.1.2.2.1.2.1")]);
}

#[test]
fn walk_stops_on_end_of_mib_and_non_advancing_oids() {
    // Arrange
    let mut cursor = WalkCursor::new(&[DESCR]).expect("cursor");
    cursor.absorb(vec![(arcs("1.3.6.1.2.1.2.2.1.2.5"), text("lo"))]);

    // Act
    cursor.absorb(vec![(arcs("1.3.6.1.2.1.2.2.1.2.5"), text("lo"))]);

    // Assert
    assert!(cursor.is_done());
    assert_eq!(cursor.into_table().len(), 1);
}

#[test]
fn empty_response_ends_the_walk() {
    // Arrange
    let mut cursor = WalkCursor::new(&[DESCR, OPER]).expect("cursor");

    // Act
    cursor.absorb(Vec::new());

    // Assert
    assert!(cursor.is_done());
    assert!(cursor.into_table().is_empty());
}

#[test]
fn mac_is_formatted_from_six_octets() {
    assert_eq!(
        SnmpValue::Bytes(vec![0x00, 0x1b, 0x54, 0xaa, 0x0f, 0x10]).as_mac(),
        Some("00:1b:54:aa:0f:10".to_string())
    );
    assert_eq!(SnmpValue::Bytes(vec![0; 6]).as_mac(), None);
    assert_eq!(SnmpValue::Bytes(vec![1, 2, 3]).as_mac(), None);
    assert_eq!(SnmpValue::Missing.as_mac(), None);
}

#[test]
fn text_and_numeric_accessors() {
    assert_eq!(text("  core-sw  ").as_text(), Some("core-sw".to_string()));
    assert_eq!(text("").as_text(), None);
    assert_eq!(text("42").as_u64(), Some(42));
    assert_eq!(SnmpValue::Integer(-1).as_u64(), None);
    assert_eq!(SnmpValue::Ticks(360_000).as_u64(), Some(360_000));
    assert_eq!(SnmpValue::Counter(7).as_f64(), Some(7.0));
    assert_eq!(SnmpValue::Missing.as_i64(), None);
}

#[test]
fn target_is_built_from_settings_snapshot() {
    // Arrange
    let settings = Settings {
        snmp_community: "monitor".to_string(),
        snmp_timeout_secs: 2,
        snmp_retries: 1,
        ..Settings::default()
    };

    // Act
    let target = SnmpTarget::new(Ipv4Addr::new(10, 1, 1, 1), &settings);

    // Assert
    assert_eq!(target.community, "monitor");
    assert_eq!(target.timeout, Duration::from_secs(2));
    assert_eq!(target.retries, 1);
    assert_eq!(target.port, 161);
}

#[test]
fn vendor_is_recognized_from_enterprise_number() {
    assert_eq!(Vendor::from_sys_object_id("1.3.6.1.4.1.9.1.1208"), Vendor::Cisco);
    assert_eq!(Vendor::from_sys_object_id(".1.3.6.1.4.1.2636.1.1.1.2.29"), Vendor::Juniper);
    assert_eq!(Vendor::from_sys_object_id("1.3.6.1.4.1.8072.3.2.10"), Vendor::NetSnmp);
    assert_eq!(Vendor::from_sys_object_id("1.3.6.1.2.1.1"), Vendor::Unknown);
}
