use crate::context::DeviceContext;
use crate::device::Interfaces;
use crate::routing::{self, Lsdb, Route};
use netsim_abstract::{
    DeviceId, DeviceKind, LinkId, LinkState, Packet, PacketPayload, PacketType, SimTime,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Packet ids of recently flooded broadcasts, forgotten after `ttl`.
#[derive(Debug, Clone)]
struct BroadcastCache {
    ttl: SimTime,
    order: VecDeque<(u64, SimTime)>,
    seen: HashSet<u64>,
}

impl BroadcastCache {
    fn new(ttl: SimTime) -> Self {
        Self {
            ttl,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn evict(&mut self, now: SimTime) {
        while let Some(&(id, expires)) = self.order.front() {
            if expires > now {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&id);
        }
    }

    /// Returns false if `id` was already seen.
    fn insert(&mut self, id: u64, now: SimTime) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back((id, now.saturating_add(self.ttl)));
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterCounters {
    pub forwarded: u64,
    pub flooded: u64,
    pub duplicate_broadcasts: u64,
    pub dropped_no_route: u64,
    pub dropped_ttl: u64,
}

#[derive(Debug)]
pub struct Router {
    id: DeviceId,
    label: String,
    interfaces: Interfaces,
    lsdb: Lsdb,
    routes: Vec<Route>,
    fib: BTreeMap<Ipv4Addr, LinkId>,
    broadcast_cache: BroadcastCache,
    counters: RouterCounters,
}

impl Router {
    pub fn new(id: DeviceId, label: impl Into<String>, broadcast_cache_ttl: SimTime) -> Self {
        Self {
            id,
            label: label.into(),
            interfaces: Interfaces::default(),
            lsdb: Lsdb::default(),
            routes: Vec::new(),
            fib: BTreeMap::new(),
            broadcast_cache: BroadcastCache::new(broadcast_cache_ttl),
            counters: RouterCounters::default(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    pub fn lsdb(&self) -> &Lsdb {
        &self.lsdb
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn fib(&self) -> &BTreeMap<Ipv4Addr, LinkId> {
        &self.fib
    }

    pub fn counters(&self) -> RouterCounters {
        self.counters
    }

    pub(crate) fn attach_link(&mut self, ctx: &mut dyn DeviceContext, state: LinkState) {
        let Some(interface) = self.interfaces.attach(self.id, &state) else {
            return;
        };
        self.lsdb.learn(state);

        self.originate(
            ctx,
            PacketType::LinkUp,
            PacketPayload::Link(state),
            Some(state.id),
        );
        if interface.peer_kind == DeviceKind::Router {
            // Exchange databases with the new neighbour
            let snapshot = self.lsdb.snapshot();
            self.originate(ctx, PacketType::Lsa, PacketPayload::Lsdb(snapshot), None);
        }
        ctx.request_route_rebuild();
    }

    pub(crate) fn detach_link(&mut self, ctx: &mut dyn DeviceContext, state: LinkState) {
        if self.interfaces.detach(state.id).is_none() {
            return;
        }
        self.lsdb.withdraw(state.id);
        self.originate(
            ctx,
            PacketType::LinkDown,
            PacketPayload::Link(state),
            Some(state.id),
        );
        ctx.request_route_rebuild();
    }

    /// Floods a changed entry (metric update) for a local link.
    pub(crate) fn advertise_link_state(&mut self, ctx: &mut dyn DeviceContext, state: LinkState) {
        if self.lsdb.learn(state) {
            ctx.request_route_rebuild();
        }
        self.originate(ctx, PacketType::Lsa, PacketPayload::Lsdb(vec![state]), None);
    }

    pub(crate) fn receive(&mut self, ctx: &mut dyn DeviceContext, link: LinkId, mut packet: Packet) {
        let now = ctx.now();
        self.broadcast_cache.evict(now);

        if packet.kind.is_routing() {
            self.on_routing_packet(ctx, link, packet);
            return;
        }

        packet.ttl = packet.ttl.saturating_sub(1);
        if packet.ttl == 0 {
            self.counters.dropped_ttl += 1;
            debug!(router = %self.id, packet = packet.id, "ttl expired");
            return;
        }
        if packet.is_broadcast() {
            debug!(router = %self.id, packet = packet.id, "non-routing broadcast dropped");
            return;
        }

        match self.fib.get(&packet.dst_ip) {
            Some(&out) => {
                self.counters.forwarded += 1;
                ctx.transmit(out, packet);
            }
            None => {
                self.counters.dropped_no_route += 1;
                warn!(router = %self.id, dst = %packet.dst_ip, "no route, packet dropped");
                ctx.log_event(format!("{} no route to {}", self.label, packet.dst_ip));
            }
        }
    }

    fn on_routing_packet(&mut self, ctx: &mut dyn DeviceContext, link: LinkId, mut packet: Packet) {
        if !self.broadcast_cache.insert(packet.id, ctx.now()) {
            self.counters.duplicate_broadcasts += 1;
            return;
        }

        let changed = match (packet.kind, &packet.payload) {
            (PacketType::LinkUp, Some(PacketPayload::Link(state))) => self.lsdb.learn(*state),
            (PacketType::LinkDown, Some(PacketPayload::Link(state))) => {
                self.lsdb.withdraw(state.id)
            }
            (PacketType::Lsa, Some(PacketPayload::Lsdb(states))) => {
                self.lsdb.merge(states.iter().copied())
            }
            (kind, _) => {
                debug!(router = %self.id, ?kind, "routing packet without payload");
                false
            }
        };
        if changed {
            ctx.request_route_rebuild();
        }

        packet.ttl = packet.ttl.saturating_sub(1);
        if packet.ttl == 0 {
            self.counters.dropped_ttl += 1;
            return;
        }
        self.flood(ctx, packet, Some(link));
    }

    /// Creates a new broadcast and floods it.
    fn originate(
        &mut self,
        ctx: &mut dyn DeviceContext,
        kind: PacketType,
        payload: PacketPayload,
        except: Option<LinkId>,
    ) {
        let id = ctx.next_packet_id();
        self.broadcast_cache.insert(id, ctx.now());
        self.flood(ctx, Packet::routing(id, kind, payload), except);
    }

    /// Sends a copy of `packet` to every neighbouring router except over
    /// `except`. Copies keep the packet id.
    fn flood(&mut self, ctx: &mut dyn DeviceContext, packet: Packet, except: Option<LinkId>) {
        let targets: Vec<LinkId> = self
            .interfaces
            .iter()
            .filter(|i| i.peer_kind == DeviceKind::Router && Some(i.link) != except)
            .map(|i| i.link)
            .collect();
        for link in targets {
            self.counters.flooded += 1;
            ctx.transmit(link, packet.clone());
        }
    }

    pub(crate) fn rebuild_routes(&mut self) {
        self.routes = routing::shortest_paths(&self.lsdb, self.id);
        self.fib = routing::derive_fib(&self.routes, &self.interfaces);
        debug!(
            router = %self.id,
            links = self.lsdb.len(),
            routes = self.fib.len(),
            "routing table rebuilt"
        );
    }
}
