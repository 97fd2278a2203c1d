use netsim_abstract::SimTime;
use netsim_abstract::link::BYTES_PER_KB;
use netsim_abstract::time::as_millis_f64;
use serde::Serialize;
use std::collections::VecDeque;

/// A time-ordered sequence of `(time, value)` points, oldest dropped first.
#[derive(Debug, Clone, Serialize)]
pub struct Series {
    #[serde(skip)]
    retention: usize,
    points: VecDeque<(SimTime, f64)>,
}

impl Series {
    pub fn new(retention: usize) -> Self {
        Self {
            retention,
            points: VecDeque::with_capacity(retention.min(1_024)),
        }
    }

    pub fn push(&mut self, time: SimTime, value: f64) {
        if self.retention == 0 {
            return;
        }
        if self.points.len() == self.retention {
            self.points.pop_front();
        }
        self.points.push_back((time, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SimTime, f64)> {
        self.points.iter()
    }

    pub fn last(&self) -> Option<f64> {
        self.points.back().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Bits per microsecond, which is the same as Mbps.
fn throughput_mbps(bytes: u64, interval: SimTime) -> f64 {
    if interval == 0 {
        return 0.0;
    }
    (bytes * 8) as f64 / interval as f64
}

/// Statistics of one direction of a link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkDirectionStats {
    pub delivered_packets: u64,
    pub delivered_bytes: u64,
    pub lost_packets: u64,
    pub overflow_drops: u64,
    pub latency_ms: Series,
    pub throughput_mbps: Series,
    pub lost: Series,
    pub buffer_kb: Series,
    #[serde(skip)]
    window: LinkWindow,
}

#[derive(Debug, Clone, Default)]
struct LinkWindow {
    bytes: u64,
    latency_sum: SimTime,
    deliveries: u64,
    lost: u64,
    occupancy_sum: u64,
    occupancy_samples: u64,
}

impl LinkDirectionStats {
    pub fn new(retention: usize) -> Self {
        Self {
            delivered_packets: 0,
            delivered_bytes: 0,
            lost_packets: 0,
            overflow_drops: 0,
            latency_ms: Series::new(retention),
            throughput_mbps: Series::new(retention),
            lost: Series::new(retention),
            buffer_kb: Series::new(retention),
            window: LinkWindow::default(),
        }
    }

    /// `latency` spans from enqueue to delivery, queueing included.
    pub fn record_delivery(&mut self, bytes: u32, latency: SimTime) {
        self.delivered_packets += 1;
        self.delivered_bytes += bytes as u64;
        self.window.bytes += bytes as u64;
        self.window.latency_sum += latency;
        self.window.deliveries += 1;
    }

    pub fn record_loss(&mut self) {
        self.lost_packets += 1;
        self.window.lost += 1;
    }

    pub fn record_overflow(&mut self) {
        self.overflow_drops += 1;
        self.window.lost += 1;
    }

    pub fn record_occupancy(&mut self, used_bytes: u64) {
        self.window.occupancy_sum += used_bytes;
        self.window.occupancy_samples += 1;
    }

    pub fn sample(&mut self, now: SimTime, interval: SimTime, used_bytes: u64) {
        let window = std::mem::take(&mut self.window);

        let latency = if window.deliveries > 0 {
            as_millis_f64(window.latency_sum / window.deliveries)
        } else {
            0.0
        };
        let occupancy = if window.occupancy_samples > 0 {
            window.occupancy_sum as f64 / window.occupancy_samples as f64
        } else {
            used_bytes as f64
        };

        self.latency_ms.push(now, latency);
        self.throughput_mbps
            .push(now, throughput_mbps(window.bytes, interval));
        self.lost.push(now, window.lost as f64);
        self.buffer_kb.push(now, occupancy / BYTES_PER_KB as f64);
    }
}

/// Statistics of a sender flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    pub cwnd: Series,
    pub rtt_ms: Series,
    pub throughput_mbps: Series,
    #[serde(skip)]
    acked_in_window: u64,
}

impl FlowStats {
    pub fn new(retention: usize) -> Self {
        Self {
            cwnd: Series::new(retention),
            rtt_ms: Series::new(retention),
            throughput_mbps: Series::new(retention),
            acked_in_window: 0,
        }
    }

    pub fn record_acked(&mut self, bytes: u64) {
        self.acked_in_window += bytes;
    }

    pub fn sample(&mut self, now: SimTime, interval: SimTime, cwnd: f64, rtt: Option<f64>) {
        let acked = std::mem::take(&mut self.acked_in_window);
        self.cwnd.push(now, cwnd);
        if let Some(rtt) = rtt {
            self.rtt_ms.push(now, rtt / 1_000.0);
        }
        self.throughput_mbps.push(now, throughput_mbps(acked, interval));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_is_bounded() {
        let mut series = Series::new(3);
        for i in 0..5 {
            series.push(i, i as f64);
        }
        assert_eq!(series.len(), 3);
        let times: Vec<_> = series.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![2, 3, 4]);
        assert_eq!(series.last(), Some(4.0));

        let mut disabled = Series::new(0);
        disabled.push(1, 1.0);
        assert!(disabled.is_empty());
    }

    #[test]
    fn link_sample_resets_window() {
        let mut stats = LinkDirectionStats::new(10);
        stats.record_delivery(1_000, 2_000);
        stats.record_delivery(1_000, 4_000);
        stats.record_loss();
        stats.record_occupancy(2_048);

        stats.sample(1_000_000, 1_000_000, 0);
        assert_eq!(stats.latency_ms.last(), Some(3.0));
        assert_eq!(stats.throughput_mbps.last(), Some(0.016));
        assert_eq!(stats.lost.last(), Some(1.0));
        assert_eq!(stats.buffer_kb.last(), Some(2.0));

        stats.sample(2_000_000, 1_000_000, 0);
        assert_eq!(stats.throughput_mbps.last(), Some(0.0));
        assert_eq!(stats.lost.last(), Some(0.0));
        assert_eq!(stats.delivered_packets, 2);
        assert_eq!(stats.lost_packets, 1);
    }

    #[test]
    fn flow_throughput_from_acked_bytes() {
        let mut stats = FlowStats::new(10);
        stats.record_acked(125_000);
        stats.sample(100_000, 100_000, 4.0, Some(20_000.0));
        assert_eq!(stats.throughput_mbps.last(), Some(10.0));
        assert_eq!(stats.rtt_ms.last(), Some(20.0));
        assert_eq!(stats.cwnd.last(), Some(4.0));
    }
}
