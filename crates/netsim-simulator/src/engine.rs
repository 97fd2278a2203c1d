use crate::context::{ActionBuffer, DeviceContext, ScopedContext, TimerKind, TimerOp};
use crate::device::Device;
use crate::link::{Admission, Direction, Link};
use crate::trace::{EventSummary, FibEntry, FlowReport, LinkReport, RouterReport, SimulationReport};
use netsim_abstract::time::{MICROS_PER_MS, as_millis_f64};
use netsim_abstract::{BufferPolicy, DeviceId, DeviceKind, LinkId, Packet, SimConfig, SimTime};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use tracing::debug;

#[derive(Debug)]
pub(crate) enum EventType {
    PacketArrival {
        link: LinkId,
        direction: Direction,
        to: DeviceId,
        packet: Packet,
        enqueued_at: SimTime,
    },
    /// The head of a link queue is free again
    LinkDequeue { link: LinkId, direction: Direction },
    TimerExpiry {
        device: DeviceId,
        timer: TimerKind,
        generation: u64,
    },
    RebuildRoutes { router: DeviceId },
    StatsTick,
}

#[derive(Debug)]
struct Event {
    time: SimTime,
    event_type: EventType,
    id: u64, // Unique ID to differentiate events at same time
}

// Custom Ord for Min-Heap (smallest time pops first)
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for time: smallest time is Greater in BinaryHeap
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Virtual-time network simulator.
///
/// All state lives here: devices, links and the event queue. Devices never
/// call back into the simulator; they record actions through a context and
/// the simulator applies them after the handler returns.
pub struct Simulator {
    time: SimTime,
    event_queue: BinaryHeap<Event>,
    event_id_counter: u64,

    pub(crate) config: SimConfig,
    rng: StdRng,

    pub(crate) devices: BTreeMap<DeviceId, Device>,
    pub(crate) links: BTreeMap<LinkId, Link>,
    pub(crate) device_id_counter: u64,
    pub(crate) link_id_counter: u64,
    pub(crate) flow_id_counter: u64,
    packet_id_counter: u64,

    /// Timer generations to handle cancellation.
    /// Key: (device, timer), Value: generation of the armed timer
    timer_generations: HashMap<(DeviceId, TimerKind), u64>,
    pending_rebuilds: BTreeSet<DeviceId>,
    stats_scheduled: bool,

    events: VecDeque<EventSummary>,
    events_dropped: u64,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);

        Self {
            time: 0,
            event_queue: BinaryHeap::new(),
            event_id_counter: 0,
            config,
            rng,
            devices: BTreeMap::new(),
            links: BTreeMap::new(),
            device_id_counter: 0,
            link_id_counter: 0,
            // Flow 0 is reserved for routing traffic
            flow_id_counter: 1,
            packet_id_counter: 0,
            timer_generations: HashMap::new(),
            pending_rebuilds: BTreeSet::new(),
            stats_scheduled: false,
            events: VecDeque::new(),
            events_dropped: 0,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn current_time(&self) -> SimTime {
        self.time
    }

    pub fn peek_next_event_time(&self) -> Option<SimTime> {
        self.event_queue.peek().map(|e| e.time)
    }

    pub fn remaining_events(&self) -> usize {
        self.event_queue.len()
    }

    pub fn events(&self) -> impl Iterator<Item = &EventSummary> {
        self.events.iter()
    }

    fn push_event(&mut self, time: SimTime, event_type: EventType) {
        let is_tick = matches!(event_type, EventType::StatsTick);
        self.event_queue.push(Event {
            time,
            event_type,
            id: self.event_id_counter,
        });
        self.event_id_counter += 1;

        if !is_tick && !self.stats_scheduled && self.config.stats_interval_ms > 0 {
            self.stats_scheduled = true;
            let interval = self.config.stats_interval_ms.saturating_mul(MICROS_PER_MS);
            let at = self.time.saturating_add(interval);
            self.push_event(at, EventType::StatsTick);
        }
    }

    pub(crate) fn record_event(&mut self, description: String) {
        if self.config.event_log_limit == 0 {
            self.events_dropped += 1;
            return;
        }
        if self.events.len() == self.config.event_log_limit {
            self.events.pop_front();
            self.events_dropped += 1;
        }
        self.events.push_back(EventSummary {
            time: self.time,
            description,
        });
    }

    /// Process the next event. Returns true if an event was processed, false if queue is empty.
    pub fn step(&mut self) -> bool {
        let event = match self.event_queue.pop() {
            Some(e) => e,
            None => return false,
        };

        self.time = event.time;

        match event.event_type {
            EventType::PacketArrival {
                link,
                direction,
                to,
                packet,
                enqueued_at,
            } => {
                // Events of a detached link are dropped with it
                let Some(l) = self.links.get_mut(&link) else {
                    debug!(%link, packet = packet.id, "arrival on detached link discarded");
                    return true;
                };
                l.record_delivery(direction, &packet, enqueued_at, self.time);
                self.with_device(to, |device, ctx| device.receive(ctx, link, packet));
            }
            EventType::LinkDequeue { link, direction } => {
                self.pump_link(link, direction);
            }
            EventType::TimerExpiry {
                device,
                timer,
                generation,
            } => {
                // Check if this timer event is still valid by comparing generations
                match self.timer_generations.get(&(device, timer)) {
                    Some(&current) if current == generation => {}
                    _ => {
                        debug!(%device, ?timer, "skipping cancelled timer");
                        return true;
                    }
                }
                self.with_device(device, |d, ctx| d.on_timer(ctx, timer));
            }
            EventType::RebuildRoutes { router } => {
                self.pending_rebuilds.remove(&router);
                if let Some(Device::Router(r)) = self.devices.get_mut(&router) {
                    r.rebuild_routes();
                }
            }
            EventType::StatsTick => self.sample_stats(),
        }
        true
    }

    /// Processes every event up to and including `until`, then advances the
    /// clock to `until`.
    pub fn run_until(&mut self, until: SimTime) {
        while self.peek_next_event_time().is_some_and(|t| t <= until) {
            self.step();
        }
        self.time = self.time.max(until);
    }

    pub fn run_until_idle(&mut self) {
        while self.step() {}
    }

    /// Runs `f` on a device with a fresh context, then applies whatever the
    /// device asked for. Does nothing if the device is gone.
    pub(crate) fn with_device<F>(&mut self, id: DeviceId, f: F)
    where
        F: FnOnce(&mut Device, &mut dyn DeviceContext),
    {
        let mut buffer = ActionBuffer::default();
        {
            let Some(device) = self.devices.get_mut(&id) else {
                debug!(device = %id, "event for removed device discarded");
                return;
            };
            let mut ctx = ScopedContext {
                buffer: &mut buffer,
                now: self.time,
                packet_ids: &mut self.packet_id_counter,
            };
            f(device, &mut ctx);
        }
        self.process_actions(id, buffer);
    }

    fn process_actions(&mut self, source: DeviceId, buffer: ActionBuffer) {
        for description in buffer.events {
            self.record_event(description);
        }

        // Applied in call order; re-arming or cancelling invalidates the
        // previous expiry by bumping the generation
        for op in buffer.timer_ops {
            match op {
                TimerOp::Start(delay, timer) => {
                    let generation = self.timer_generations.entry((source, timer)).or_insert(0);
                    *generation += 1;
                    let generation = *generation;
                    self.push_event(
                        self.time.saturating_add(delay),
                        EventType::TimerExpiry {
                            device: source,
                            timer,
                            generation,
                        },
                    );
                }
                TimerOp::Cancel(timer) => {
                    if let Some(generation) = self.timer_generations.get_mut(&(source, timer)) {
                        *generation += 1;
                    }
                }
            }
        }

        if buffer.rebuild_routes && self.pending_rebuilds.insert(source) {
            self.push_event(self.time, EventType::RebuildRoutes { router: source });
        }

        for (link, packet) in buffer.outgoing_packets {
            self.send_on_link(source, link, packet);
        }
    }

    fn enforce_buffer(&self, sender: DeviceKind) -> bool {
        match self.config.buffer_policy {
            BufferPolicy::RouterEgress => sender == DeviceKind::Router,
            BufferPolicy::AllDevices => true,
            BufferPolicy::Unbounded => false,
        }
    }

    fn send_on_link(&mut self, from: DeviceId, link_id: LinkId, packet: Packet) {
        let Some(kind) = self.devices.get(&from).map(Device::kind) else {
            return;
        };
        let enforce = self.enforce_buffer(kind);
        let Some(link) = self.links.get_mut(&link_id) else {
            debug!(%from, link = %link_id, "send on detached link discarded");
            return;
        };
        let Some(direction) = link.direction_from(from) else {
            return;
        };

        let packet_id = packet.id;
        match link.enqueue(direction, packet, self.time, enforce) {
            Admission::Queued {
                start_sending: true,
            } => self.pump_link(link_id, direction),
            Admission::Queued { .. } => {}
            Admission::Dropped => {
                debug!(link = %link_id, packet = packet_id, "buffer overflow");
                self.record_event(format!("{link_id} buffer overflow, packet {packet_id} dropped"));
            }
        }
    }

    /// Puts the head of a link queue on the wire and schedules its delivery
    /// and the next dequeue.
    fn pump_link(&mut self, link_id: LinkId, direction: Direction) {
        let Some(link) = self.links.get_mut(&link_id) else {
            return;
        };
        let Some(transmission) = link.transmit_next(direction, self.time, &mut self.rng) else {
            return;
        };

        self.push_event(
            transmission.next_dequeue_at,
            EventType::LinkDequeue {
                link: link_id,
                direction,
            },
        );
        match transmission.delivery {
            Some(delivery) => self.push_event(
                delivery.at,
                EventType::PacketArrival {
                    link: link_id,
                    direction,
                    to: delivery.to,
                    packet: delivery.packet,
                    enqueued_at: delivery.enqueued_at,
                },
            ),
            None => debug!(link = %link_id, ?direction, "packet lost"),
        }
    }

    /// Drops pending timers of a removed device.
    pub(crate) fn forget_timers(&mut self, device: DeviceId) {
        self.timer_generations.retain(|(owner, _), _| *owner != device);
        self.pending_rebuilds.remove(&device);
    }

    fn sample_stats(&mut self) {
        let interval = self.config.stats_interval_ms.saturating_mul(MICROS_PER_MS);
        let now = self.time;
        for link in self.links.values_mut() {
            link.sample_stats(now, interval);
        }
        for device in self.devices.values_mut() {
            if let Device::Host(host) = device {
                host.sample_stats(now, interval);
            }
        }

        // Keep sampling only while something else is going on
        if self.event_queue.is_empty() {
            self.stats_scheduled = false;
        } else {
            self.push_event(now.saturating_add(interval), EventType::StatsTick);
        }
    }

    /// Produce a serializable snapshot of the current simulation state.
    pub fn export_report(&self) -> SimulationReport {
        let flows = self
            .devices
            .values()
            .filter_map(Device::as_host)
            .flat_map(|host| host.flows().map(move |flow| (host, flow)))
            .map(|(host, flow)| FlowReport {
                flow: flow.id(),
                host: host.label().to_string(),
                destination: flow.destination(),
                algorithm: flow.algorithm(),
                status: flow.status(),
                data_bytes: flow.data_bytes(),
                acked_bytes: flow.acked_bytes(),
                delivered_bytes: self
                    .receiver_of(flow.id())
                    .map(|(_, rx)| rx.delivered_bytes()),
                retransmissions: flow.retransmissions(),
                stalled: flow.is_stalled(),
                completion_ms: flow
                    .started_at()
                    .zip(flow.completed_at())
                    .map(|(start, end)| as_millis_f64(end - start)),
                stats: flow.stats.clone(),
            })
            .collect();

        let links = self
            .links
            .values()
            .map(|link| {
                let [a, b] = link.ends();
                LinkReport {
                    link: link.id(),
                    ends: [self.label_of(a.device), self.label_of(b.device)],
                    params: link.params().clone(),
                    directions: [
                        link.queue(Direction::AtoB).stats.clone(),
                        link.queue(Direction::BtoA).stats.clone(),
                    ],
                }
            })
            .collect();

        let routers = self
            .devices
            .values()
            .filter_map(|device| Some((device.ip(), device.as_router()?)))
            .map(|(address, router)| {
                let counters = router.counters();
                RouterReport {
                    router: router.label().to_string(),
                    address,
                    known_links: router.lsdb().len(),
                    routes: router.routes().to_vec(),
                    fib: router
                        .fib()
                        .iter()
                        .map(|(destination, link)| FibEntry {
                            destination: *destination,
                            link: *link,
                        })
                        .collect(),
                    forwarded: counters.forwarded,
                    dropped_no_route: counters.dropped_no_route,
                    dropped_ttl: counters.dropped_ttl,
                }
            })
            .collect();

        SimulationReport {
            config: self.config.clone(),
            duration_ms: as_millis_f64(self.time),
            flows,
            links,
            routers,
            events: self.events.iter().cloned().collect(),
            events_dropped: self.events_dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use netsim_abstract::FlowId;

    fn sim_with_host() -> (Simulator, DeviceId) {
        let mut sim = Simulator::new(SimConfig {
            stats_interval_ms: 0,
            ..Default::default()
        });
        let id = DeviceId(1);
        sim.devices.insert(id, Device::Host(Host::new(id, "h1")));
        (sim, id)
    }

    #[test]
    fn events_pop_in_time_then_insertion_order() {
        let (mut sim, _) = sim_with_host();
        sim.push_event(20, EventType::RebuildRoutes { router: DeviceId(3) });
        sim.push_event(10, EventType::RebuildRoutes { router: DeviceId(1) });
        sim.push_event(10, EventType::RebuildRoutes { router: DeviceId(2) });

        let order: Vec<_> = std::iter::from_fn(|| sim.event_queue.pop())
            .map(|e| match e.event_type {
                EventType::RebuildRoutes { router } => (e.time, router.0),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![(10, 1), (10, 2), (20, 3)]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let (mut sim, host) = sim_with_host();
        let rto = TimerKind::Rto(FlowId(9));
        let syn = TimerKind::SynRetry(FlowId(9));

        sim.with_device(host, |_, ctx| {
            ctx.start_timer(10, rto);
            ctx.start_timer(5, syn);
        });
        sim.with_device(host, |_, ctx| ctx.cancel_timer(rto));

        // Both expiries are still queued, but only the SynRetry one is live
        assert_eq!(sim.remaining_events(), 2);
        let live: Vec<_> = sim
            .event_queue
            .iter()
            .filter_map(|e| match e.event_type {
                EventType::TimerExpiry {
                    device,
                    timer,
                    generation,
                } => Some(sim.timer_generations.get(&(device, timer)) == Some(&generation)),
                _ => None,
            })
            .collect();
        assert_eq!(live.iter().filter(|l| **l).count(), 1);

        sim.run_until_idle();
        assert_eq!(sim.current_time(), 10);
    }

    #[test]
    fn rearming_replaces_pending_expiry() {
        let (mut sim, host) = sim_with_host();
        let rto = TimerKind::Rto(FlowId(1));
        sim.with_device(host, |_, ctx| {
            ctx.start_timer(100, rto);
            ctx.start_timer(300, rto);
        });
        assert_eq!(sim.timer_generations[&(host, rto)], 2);

        let live: Vec<_> = sim
            .event_queue
            .iter()
            .filter(|e| {
                matches!(e.event_type, EventType::TimerExpiry { generation, .. } if generation == 2)
            })
            .map(|e| e.time)
            .collect();
        assert_eq!(live, vec![300]);
    }

    #[test]
    fn rebuild_requests_are_coalesced() {
        let (mut sim, host) = sim_with_host();
        sim.with_device(host, |_, ctx| ctx.request_route_rebuild());
        sim.with_device(host, |_, ctx| ctx.request_route_rebuild());
        assert_eq!(sim.remaining_events(), 1);
        sim.step();
        sim.with_device(host, |_, ctx| ctx.request_route_rebuild());
        assert_eq!(sim.remaining_events(), 1);
    }

    #[test]
    fn event_log_is_bounded() {
        let mut sim = Simulator::new(SimConfig {
            event_log_limit: 3,
            ..Default::default()
        });
        for i in 0..5 {
            sim.record_event(format!("event {i}"));
        }
        let kept: Vec<_> = sim.events().map(|e| e.description.as_str()).collect();
        assert_eq!(kept, vec!["event 2", "event 3", "event 4"]);
        assert_eq!(sim.export_report().events_dropped, 2);
    }

    #[test]
    fn stats_ticks_stop_when_idle() {
        let mut sim = Simulator::new(SimConfig::default());
        let host = DeviceId(1);
        sim.devices.insert(host, Device::Host(Host::new(host, "h1")));
        sim.with_device(host, |_, ctx| ctx.start_timer(2_500_000, TimerKind::Rto(FlowId(1))));

        sim.run_until_idle();
        // Ticks at 1 s and 2 s while the timer is pending, one more at 3 s
        assert_eq!(sim.current_time(), 3_000_000);
        assert_eq!(sim.remaining_events(), 0);
    }
}
