use crate::model::InterfaceMetric;

/// A sample lower than its predecessor is a reset and yields zero; no
/// wraparound arithmetic is applied.
pub fn counter_delta(current: u64, previous: u64) -> u64 {
    current.checked_sub(previous).unwrap_or(0)
}

pub fn discard_rate(dropped: u64, passed: u64) -> f64 {
    let total = passed as f64 + dropped as f64;
    if total == 0.0 {
        return 0.0;
    }
    dropped as f64 / total * 100.0
}

pub fn throughput_bps(byte_delta: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    byte_delta as f64 * 8.0 / elapsed_secs
}

pub fn utilization(bps: f64, speed_bps: u64) -> f64 {
    if speed_bps == 0 {
        return 0.0;
    }
    (bps / speed_bps as f64 * 100.0).min(100.0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InterfaceRates {
    pub in_bps: f64,
    pub out_bps: f64,
    pub discard_rate: f64,
    pub elapsed_secs: f64,
}

/// Rates between two samples of the same interface, `previous` being the
/// older one.
pub fn interface_rates(current: &InterfaceMetric, previous: &InterfaceMetric) -> InterfaceRates {
    let now = &current.counters;
    let before = &previous.counters;
    let elapsed_secs = (current.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;

    let dropped = counter_delta(now.discards_in, before.discards_in)
        + counter_delta(now.discards_out, before.discards_out);
    let passed = counter_delta(now.packets_in, before.packets_in)
        + counter_delta(now.packets_out, before.packets_out);

    InterfaceRates {
        in_bps: throughput_bps(counter_delta(now.octets_in, before.octets_in), elapsed_secs),
        out_bps: throughput_bps(counter_delta(now.octets_out, before.octets_out), elapsed_secs),
        discard_rate: discard_rate(dropped, passed),
        elapsed_secs,
    }
}
