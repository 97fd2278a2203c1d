use crate::stats::LinkDirectionStats;
use netsim_abstract::time::from_millis_f64;
use netsim_abstract::{
    DeviceId, LinkEnd, LinkId, LinkParams, LinkParamsUpdate, LinkState, Packet, SimTime,
};
use rand::Rng;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From `ends[0]` to `ends[1]`
    AtoB,
    BtoA,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::AtoB => 0,
            Direction::BtoA => 1,
        }
    }

    fn receiver(self) -> usize {
        1 - self.index()
    }
}

#[derive(Debug, Clone)]
struct Queued {
    packet: Packet,
    enqueued_at: SimTime,
}

#[derive(Debug, Clone)]
pub struct LinkQueue {
    buffer: VecDeque<Queued>,
    /// Bytes waiting in `buffer`
    used_bytes: u64,
    /// A dequeue is pending for this direction
    sending: bool,
    pub stats: LinkDirectionStats,
}

impl LinkQueue {
    fn new(retention: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            used_bytes: 0,
            sending: false,
            stats: LinkDirectionStats::new(retention),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `start_sending` is set when the queue was idle and the caller must
    /// start draining it.
    Queued { start_sending: bool },
    Dropped,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub at: SimTime,
    pub to: DeviceId,
    pub packet: Packet,
    pub enqueued_at: SimTime,
}

#[derive(Debug, Clone)]
pub struct Transmission {
    /// When the head of the queue is free again
    pub next_dequeue_at: SimTime,
    /// `None` if the packet was lost
    pub delivery: Option<Delivery>,
}

fn serialization_time(capacity_mbps: f64, size: u32) -> SimTime {
    let bits = size as f64 * 8.0;
    (bits / capacity_mbps.max(f64::MIN_POSITIVE)).ceil() as SimTime
}

#[derive(Debug, Clone)]
pub struct Link {
    id: LinkId,
    ends: [LinkEnd; 2],
    params: LinkParams,
    version: u64,
    queues: [LinkQueue; 2],
}

impl Link {
    pub fn new(id: LinkId, ends: [LinkEnd; 2], params: LinkParams, retention: usize) -> Self {
        Self {
            id,
            ends,
            params,
            version: 0,
            queues: [LinkQueue::new(retention), LinkQueue::new(retention)],
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn ends(&self) -> &[LinkEnd; 2] {
        &self.ends
    }

    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    pub fn queue(&self, direction: Direction) -> &LinkQueue {
        &self.queues[direction.index()]
    }

    pub fn connects(&self, a: DeviceId, b: DeviceId) -> bool {
        let [x, y] = &self.ends;
        (x.device == a && y.device == b) || (x.device == b && y.device == a)
    }

    /// Direction of traffic sent by `device`.
    pub fn direction_from(&self, device: DeviceId) -> Option<Direction> {
        if self.ends[0].device == device {
            Some(Direction::AtoB)
        } else if self.ends[1].device == device {
            Some(Direction::BtoA)
        } else {
            None
        }
    }

    /// Routing view of this link.
    pub fn state(&self) -> LinkState {
        LinkState {
            id: self.id,
            ends: self.ends,
            metric: self.params.metric,
            version: self.version,
        }
    }

    /// Applies `update`. Returns true if the metric changed, in which case
    /// the link-state version is bumped.
    pub fn update_params(&mut self, update: &LinkParamsUpdate) -> bool {
        let old_metric = self.params.metric;
        update.apply_to(&mut self.params);
        let changed = self.params.metric != old_metric;
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Time to put `size` bytes on the wire, in microseconds.
    pub fn serialization_time(&self, size: u32) -> SimTime {
        serialization_time(self.params.capacity_mbps, size)
    }

    pub fn enqueue(
        &mut self,
        direction: Direction,
        packet: Packet,
        now: SimTime,
        enforce_buffer: bool,
    ) -> Admission {
        let limit = self.params.buffer_bytes();
        let queue = &mut self.queues[direction.index()];
        let size = packet.size as u64;

        if enforce_buffer && queue.used_bytes + size > limit {
            queue.stats.record_overflow();
            return Admission::Dropped;
        }

        queue.used_bytes += size;
        debug_assert!(!enforce_buffer || queue.used_bytes <= limit);
        queue.stats.record_occupancy(queue.used_bytes);
        queue.buffer.push_back(Queued {
            packet,
            enqueued_at: now,
        });

        if queue.sending {
            Admission::Queued {
                start_sending: false,
            }
        } else {
            queue.sending = true;
            Admission::Queued {
                start_sending: true,
            }
        }
    }

    /// Takes the head of the queue and puts it on the wire. Returns `None`
    /// (and marks the direction idle) when the queue is empty.
    pub fn transmit_next<R: Rng>(
        &mut self,
        direction: Direction,
        now: SimTime,
        rng: &mut R,
    ) -> Option<Transmission> {
        let capacity = self.params.capacity_mbps;
        let loss_rate = self.params.loss_rate;
        let propagation = from_millis_f64(self.params.delay_ms);
        let to = self.ends[direction.receiver()].device;

        let queue = &mut self.queues[direction.index()];
        let Some(Queued {
            mut packet,
            enqueued_at,
        }) = queue.buffer.pop_front()
        else {
            queue.sending = false;
            return None;
        };
        queue.used_bytes -= packet.size as u64;
        queue.stats.record_occupancy(queue.used_bytes);
        packet.sent_time = Some(now);

        let next_dequeue_at = now.saturating_add(serialization_time(capacity, packet.size));
        let lost = rng.random::<f64>() * 100.0 < loss_rate;
        if lost {
            queue.stats.record_loss();
            return Some(Transmission {
                next_dequeue_at,
                delivery: None,
            });
        }

        let at = next_dequeue_at.saturating_add(propagation);
        packet.received_time = Some(at);
        Some(Transmission {
            next_dequeue_at,
            delivery: Some(Delivery {
                at,
                to,
                packet,
                enqueued_at,
            }),
        })
    }

    pub fn record_delivery(
        &mut self,
        direction: Direction,
        packet: &Packet,
        enqueued_at: SimTime,
        now: SimTime,
    ) {
        self.queues[direction.index()]
            .stats
            .record_delivery(packet.size, now.saturating_sub(enqueued_at));
    }

    pub fn sample_stats(&mut self, now: SimTime, interval: SimTime) {
        for queue in &mut self.queues {
            let used = queue.used_bytes;
            queue.stats.sample(now, interval, used);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_abstract::packet::PACKET_SIZE;
    use netsim_abstract::{DeviceKind, FlowId, PacketType};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::Ipv4Addr;

    fn link(params: LinkParams) -> Link {
        let ends = [
            LinkEnd {
                device: DeviceId(1),
                kind: DeviceKind::Router,
                ip: Ipv4Addr::new(10, 0, 0, 1),
            },
            LinkEnd {
                device: DeviceId(2),
                kind: DeviceKind::Router,
                ip: Ipv4Addr::new(10, 0, 0, 2),
            },
        ];
        Link::new(LinkId(1), ends, params, 16)
    }

    fn packet(id: u64) -> Packet {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        Packet::new(id, FlowId(1), ip, ip, PacketType::Payload, id, PACKET_SIZE)
    }

    fn lossless() -> LinkParams {
        LinkParams {
            loss_rate: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn serialization_of_1000_bytes_at_10_mbps() {
        let link = link(lossless());
        assert_eq!(link.serialization_time(1_000), 800);
    }

    #[test]
    fn delivers_after_serialization_and_propagation() {
        let mut link = link(lossless());
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(
            link.enqueue(Direction::AtoB, packet(1), 0, true),
            Admission::Queued {
                start_sending: true
            }
        );
        assert_eq!(
            link.enqueue(Direction::AtoB, packet(2), 0, true),
            Admission::Queued {
                start_sending: false
            }
        );
        assert_eq!(link.queue(Direction::AtoB).used_bytes(), 2_000);

        let first = link.transmit_next(Direction::AtoB, 0, &mut rng).unwrap();
        assert_eq!(first.next_dequeue_at, 800);
        let delivery = first.delivery.unwrap();
        assert_eq!(delivery.at, 10_800);
        assert_eq!(delivery.to, DeviceId(2));
        assert_eq!(delivery.packet.sent_time, Some(0));

        let second = link.transmit_next(Direction::AtoB, 800, &mut rng).unwrap();
        assert_eq!(second.delivery.unwrap().at, 11_600);

        assert!(link.transmit_next(Direction::AtoB, 1_600, &mut rng).is_none());
        assert_eq!(link.queue(Direction::AtoB).used_bytes(), 0);

        // Idle again: the next enqueue restarts draining
        assert_eq!(
            link.enqueue(Direction::AtoB, packet(3), 2_000, true),
            Admission::Queued {
                start_sending: true
            }
        );
    }

    #[test]
    fn router_buffer_overflow_drops() {
        let mut link = link(LinkParams {
            buffer_size_kb: 2,
            ..lossless()
        });

        // 2 KB = 2048 bytes: two packets fit, the third does not
        for id in 0..2 {
            assert!(matches!(
                link.enqueue(Direction::BtoA, packet(id), 0, true),
                Admission::Queued { .. }
            ));
        }
        assert_eq!(
            link.enqueue(Direction::BtoA, packet(2), 0, true),
            Admission::Dropped
        );
        assert!(link.queue(Direction::BtoA).used_bytes() <= link.params().buffer_bytes());
        assert_eq!(link.queue(Direction::BtoA).stats.overflow_drops, 1);

        // Unenforced (host) traffic is never dropped, and directions are independent
        assert!(matches!(
            link.enqueue(Direction::BtoA, packet(3), 0, false),
            Admission::Queued { .. }
        ));
        assert!(link.queue(Direction::AtoB).is_empty());
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut link = link(LinkParams {
            loss_rate: 100.0,
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(7);
        for id in 0..20 {
            link.enqueue(Direction::AtoB, packet(id), 0, false);
        }
        let mut now = 0;
        while let Some(tx) = link.transmit_next(Direction::AtoB, now, &mut rng) {
            assert!(tx.delivery.is_none());
            now = tx.next_dequeue_at;
        }
        assert_eq!(link.queue(Direction::AtoB).stats.lost_packets, 20);
    }

    #[test]
    fn metric_change_bumps_version() {
        let mut link = link(lossless());
        assert!(!link.update_params(&LinkParamsUpdate {
            capacity_mbps: Some(100.0),
            ..Default::default()
        }));
        assert_eq!(link.state().version, 0);

        assert!(link.update_params(&LinkParamsUpdate {
            metric: Some(1),
            ..Default::default()
        }));
        let state = link.state();
        assert_eq!(state.metric, 1);
        assert_eq!(state.version, 1);
        assert_eq!(link.serialization_time(1_000), 80);
    }
}
