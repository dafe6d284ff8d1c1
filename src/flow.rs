//! Flow identity and the sliding-window throughput estimator.
//!
//! A [`FlowId`] names a customer flow by its IPv4 destination and UDP
//! destination port. [`FlowStat`] turns a stream of cumulative byte-counter
//! samples into smoothed throughput figures; [`FlowStatManager`] keeps one
//! `FlowStat` per flow for a single switch.

use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;

use crate::error::{Error, FlowKey, Result};

/// A scaling prefix applied to byte/bit counts, matching the source's
/// `{None, K, M, G}` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prefix {
    /// No scaling.
    None,
    /// ×10⁻³
    Kilo,
    /// ×10⁻⁶
    Mega,
    /// ×10⁻⁹
    Giga,
}

impl Prefix {
    fn scale(self) -> f64 {
        match self {
            Prefix::None => 1.0,
            Prefix::Kilo => 1e-3,
            Prefix::Mega => 1e-6,
            Prefix::Giga => 1e-9,
        }
    }
}

/// Immutable key identifying a customer flow: an IPv4 destination and a UDP
/// destination port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId {
    pub ipv4_dst: String,
    pub udp_dst: u16,
}

impl FlowId {
    pub fn new(ipv4_dst: impl Into<String>, udp_dst: u16) -> Self {
        FlowId {
            ipv4_dst: ipv4_dst.into(),
            udp_dst,
        }
    }

    /// Build a [`FlowId`] from a parsed config record, failing if either
    /// field is absent or malformed.
    pub fn from_record(ipv4_dst: Option<&str>, udp_dst: Option<i64>) -> Result<Self> {
        let ipv4_dst = ipv4_dst
            .ok_or_else(|| Error::InvalidFlowRecord("missing ipv4_dst".to_string()))?
            .to_string();
        let udp_dst = udp_dst
            .ok_or_else(|| Error::InvalidFlowRecord("missing udp_dst".to_string()))?;
        let udp_dst = u16::try_from(udp_dst)
            .map_err(|_| Error::InvalidFlowRecord(format!("udp_dst out of range: {}", udp_dst)))?;
        Ok(FlowId { ipv4_dst, udp_dst })
    }

    pub fn key(&self) -> FlowKey {
        FlowKey(self.ipv4_dst.clone(), self.udp_dst)
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ipv4_dst, self.udp_dst)
    }
}

/// A single sample in a [`FlowStat`]'s window: a cumulative byte count and
/// the monotonic timestamp (seconds) it was observed at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowStatEntry {
    pub value: u64,
    pub timestamp: f64,
}

/// Sliding window of up to `window_size` cumulative-byte-counter samples for
/// a single flow, oldest first.
///
/// Invariants: `len() <= window_size`; values are non-negative and
/// monotonically non-decreasing (the counter is cumulative, so a decrease
/// indicates a switch restart or a counter wrap, and is rejected).
#[derive(Clone, Debug)]
pub struct FlowStat {
    data: VecDeque<FlowStatEntry>,
    window_size: usize,
}

impl FlowStat {
    pub fn new(window_size: usize) -> Self {
        FlowStat {
            data: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a new sample.
    ///
    /// Rejects a value that is smaller than the last recorded value
    /// (non-monotonic counter) without mutating the window. If the window
    /// would exceed `window_size`, the oldest entry is dropped (FIFO).
    pub fn put(&mut self, value: u64, timestamp: f64) -> Result<()> {
        if let Some(last) = self.data.back() {
            if value < last.value {
                return Err(Error::NonMonotonicSample {
                    last: last.value,
                    new: value,
                });
            }
        }
        if self.data.len() >= self.window_size {
            self.data.pop_front();
        }
        self.data.push_back(FlowStatEntry { value, timestamp });
        Ok(())
    }

    /// Mean byte-delta per sample interval over the window.
    ///
    /// Empty window returns 0; a single sample returns that sample's raw
    /// value (a deliberate warmup figure: it prevents the controller from
    /// treating every flow as idle on the very first measurement cycle).
    pub fn get_avg(&self, prefix: Prefix) -> f64 {
        match self.data.len() {
            0 => 0.0,
            1 => self.data[0].value as f64,
            n => {
                let first = self.data.front().unwrap();
                let last = self.data.back().unwrap();
                (last.value - first.value) as f64 * prefix.scale() / (n - 1) as f64
            }
        }
    }

    /// Average throughput over the window in bytes/second.
    ///
    /// Returns 0 when the window holds at most one sample, or when the
    /// timestamp delta between the oldest and newest sample is zero.
    pub fn get_avg_speed(&self, prefix: Prefix) -> f64 {
        if self.data.len() <= 1 {
            return 0.0;
        }
        let first = self.data.front().unwrap();
        let last = self.data.back().unwrap();
        let dt = last.timestamp - first.timestamp;
        if dt == 0.0 {
            return 0.0;
        }
        (last.value - first.value) as f64 * prefix.scale() / dt
    }

    /// Average throughput over the window in bits/second.
    pub fn get_avg_speed_bps(&self, prefix: Prefix) -> f64 {
        self.get_avg_speed(prefix) * 8.0
    }
}

/// Per-switch mapping from [`FlowId`] to its [`FlowStat`]. A new `FlowStat`
/// is created lazily on the first sample seen for a flow.
#[derive(Clone, Debug, Default)]
pub struct FlowStatManager {
    stats: HashMap<FlowId, FlowStat>,
    window_size: usize,
}

impl FlowStatManager {
    pub fn new(window_size: usize) -> Self {
        FlowStatManager {
            stats: HashMap::new(),
            window_size,
        }
    }

    /// Record a new sample for `flow`, creating its `FlowStat` on first
    /// sight.
    pub fn put(&mut self, flow: FlowId, value: u64, timestamp: f64) -> Result<()> {
        let window_size = self.window_size;
        self.stats
            .entry(flow)
            .or_insert_with(|| FlowStat::new(window_size))
            .put(value, timestamp)
    }

    pub fn get(&self, flow: &FlowId) -> Result<&FlowStat> {
        self.stats
            .get(flow)
            .ok_or_else(|| Error::FlowNotFound(flow.key()))
    }

    /// Snapshot of bits/second throughput for every tracked flow.
    pub fn export_avg_speeds_bps(&self, prefix: Prefix) -> HashMap<FlowId, f64> {
        self.stats
            .iter()
            .map(|(k, v)| (k.clone(), v.get_avg_speed_bps(prefix)))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_window_average() {
        let s = FlowStat::new(10);
        assert_eq!(s.get_avg(Prefix::None), 0.0);
        assert_eq!(s.get_avg_speed(Prefix::None), 0.0);
    }

    #[test]
    fn single_sample_warmup_value() {
        let mut s = FlowStat::new(10);
        s.put(42, 0.0).unwrap();
        assert_eq!(s.get_avg(Prefix::None), 42.0);
        assert_eq!(s.get_avg_speed(Prefix::None), 0.0);
    }

    #[test]
    fn arithmetic_mean_of_deltas() {
        let mut s = FlowStat::new(10);
        for (v, t) in [(1u64, 0.0), (3, 5.0), (5, 10.0), (7, 15.0)] {
            s.put(v, t).unwrap();
        }
        assert_eq!(s.get_avg_speed(Prefix::None), 0.4);
        assert_eq!(s.get_avg_speed_bps(Prefix::None), 3.2);
    }

    #[test]
    fn prefix_scaling() {
        let mut s = FlowStat::new(10);
        for (v, t) in [(1u64, 0.0), (3, 5.0), (5, 10.0), (7, 15.0)] {
            s.put(v, t).unwrap();
        }
        assert_eq!(s.get_avg(Prefix::Mega), 2.0 / 1_000_000.0);
    }

    #[test]
    fn identical_timestamps_no_divide_by_zero() {
        let mut s = FlowStat::new(10);
        s.put(1, 5.0).unwrap();
        s.put(5, 5.0).unwrap();
        assert_eq!(s.get_avg_speed(Prefix::None), 0.0);
    }

    #[test]
    fn non_monotonic_sample_rejected() {
        let mut s = FlowStat::new(10);
        s.put(5, 0.0).unwrap();
        let err = s.put(4, 1.0);
        assert!(err.is_err());
        assert_eq!(s.len(), 1);
        assert_eq!(s.get_avg(Prefix::None), 5.0);
    }

    #[test]
    fn window_drops_oldest_entry() {
        let mut s = FlowStat::new(3);
        for i in 0..5u64 {
            s.put(i, i as f64).unwrap();
        }
        assert_eq!(s.len(), 3);
        // Oldest two entries (0, 1) were dropped; window is [2, 3, 4].
        assert_eq!(s.get_avg(Prefix::None), 1.0);
    }

    #[test]
    fn flow_stat_manager_creates_on_first_sight() {
        let mut m = FlowStatManager::new(10);
        let f = FlowId::new("10.0.0.1", 5001);
        assert!(m.get(&f).is_err());
        m.put(f.clone(), 100, 0.0).unwrap();
        assert!(m.get(&f).is_ok());
    }

    #[test]
    fn flow_id_round_trip() {
        let f = FlowId::from_record(Some("10.0.0.2"), Some(6000)).unwrap();
        assert_eq!(f.ipv4_dst, "10.0.0.2");
        assert_eq!(f.udp_dst, 6000);
    }

    #[test]
    fn flow_id_missing_field_fails() {
        assert!(FlowId::from_record(None, Some(5000)).is_err());
        assert!(FlowId::from_record(Some("10.0.0.1"), None).is_err());
    }
}
