use chrono::Duration;

use crate::counters::{counter_delta, discard_rate, interface_rates, throughput_bps, utilization};
use crate::model::{InterfaceCounters, InterfaceMetric, OPER_STATUS_UP};
use crate::test_support::at;

fn sample(seconds: i64, counters: InterfaceCounters) -> InterfaceMetric {
    InterfaceMetric {
        interface_id: 1,
        timestamp: at(0) + Duration::seconds(seconds),
        admin_status: 1,
        oper_status: OPER_STATUS_UP,
        counters,
    }
}

#[test]
fn counter_delta_treats_decrease_as_reset() {
    assert_eq!(counter_delta(1_500, 1_000), 500);
    assert_eq!(counter_delta(1_000, 1_000), 0);
    assert_eq!(counter_delta(10, 4_294_967_000), 0);
}

#[test]
fn discard_rate_is_share_of_all_packets() {
    assert_eq!(discard_rate(0, 0), 0.0);
    assert_eq!(discard_rate(0, 500), 0.0);
    assert_eq!(discard_rate(50, 50), 50.0);
    assert!((discard_rate(50, 1_000) - 4.7619).abs() < 1e-3);
}

#[test]
fn throughput_and_utilization_guard_against_zero() {
    assert_eq!(throughput_bps(1_000, 0.0), 0.0);
    assert_eq!(throughput_bps(125, 1.0), 1_000.0);
    assert_eq!(utilization(500.0, 0), 0.0);
    assert_eq!(utilization(500.0, 1_000), 50.0);
    assert_eq!(utilization(5_000.0, 1_000), 100.0);
}

#[test]
fn interface_rates_use_elapsed_time_between_samples() {
    // Arrange
    let previous = sample(
        0,
        InterfaceCounters {
            octets_in: 1_000,
            octets_out: 0,
            packets_in: 100,
            ..InterfaceCounters::default()
        },
    );
    let current = sample(
        60,
        InterfaceCounters {
            octets_in: 61_000,
            octets_out: 7_500,
            packets_in: 290,
            discards_in: 10,
            ..InterfaceCounters::default()
        },
    );

    // Act
    let rates = interface_rates(&current, &previous);

    // Assert
    assert_eq!(rates.elapsed_secs, 60.0);
    assert_eq!(rates.in_bps, 8_000.0);
    assert_eq!(rates.out_bps, 1_000.0);
    assert!((rates.discard_rate - 5.0).abs() < 1e-9);
}

#[test]
fn interface_rates_after_counter_reset_are_zero() {
    // Arrange
    let previous = sample(
        0,
        InterfaceCounters {
            octets_in: 9_000_000,
            packets_in: 50_000,
            discards_in: 400,
            ..InterfaceCounters::default()
        },
    );
    let current = sample(
        60,
        InterfaceCounters {
            octets_in: 200,
            packets_in: 3,
            discards_in: 0,
            ..InterfaceCounters::default()
        },
    );

    // Act
    let rates = interface_rates(&current, &previous);

    // Assert
    assert_eq!(rates.in_bps, 0.0);
    assert_eq!(rates.discard_rate, 0.0);
}
