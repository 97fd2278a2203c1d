use crate::device::Interfaces;
use netsim_abstract::{DeviceId, DeviceKind, LinkId, LinkState};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::net::Ipv4Addr;

/// A router's view of the network.
///
/// Entries are keyed by link id and only ever replaced by a newer version.
/// Withdrawn ids are remembered so a stale advertisement cannot bring a
/// removed link back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lsdb {
    links: BTreeMap<LinkId, LinkState>,
    withdrawn: BTreeSet<LinkId>,
}

impl Lsdb {
    /// Returns true if the database changed.
    pub fn learn(&mut self, state: LinkState) -> bool {
        if self.withdrawn.contains(&state.id) {
            return false;
        }
        match self.links.get(&state.id) {
            Some(known) if known.version >= state.version => false,
            _ => {
                self.links.insert(state.id, state);
                true
            }
        }
    }

    pub fn merge<I>(&mut self, states: I) -> bool
    where
        I: IntoIterator<Item = LinkState>,
    {
        states
            .into_iter()
            .fold(false, |changed, state| self.learn(state) | changed)
    }

    pub fn withdraw(&mut self, link: LinkId) -> bool {
        self.withdrawn.insert(link);
        self.links.remove(&link).is_some()
    }

    pub fn snapshot(&self) -> Vec<LinkState> {
        self.links.values().copied().collect()
    }

    pub fn get(&self, link: LinkId) -> Option<&LinkState> {
        self.links.get(&link)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkState> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub host: DeviceId,
    /// Neighbour of the source on the chosen path
    pub first_hop: DeviceId,
    pub cost: u64,
}

/// Runs Dijkstra over the links in `lsdb` from `source` and returns a route
/// for every reachable host. Hosts are never used as transit vertices.
/// Equal-cost ties go to the lower device id.
pub fn shortest_paths(lsdb: &Lsdb, source: DeviceId) -> Vec<Route> {
    let mut adjacency: BTreeMap<DeviceId, Vec<(DeviceId, u64)>> = BTreeMap::new();
    let mut hosts: BTreeMap<DeviceId, Ipv4Addr> = BTreeMap::new();

    for state in lsdb.iter() {
        let [a, b] = &state.ends;
        let metric = state.metric as u64;
        adjacency.entry(a.device).or_default().push((b.device, metric));
        adjacency.entry(b.device).or_default().push((a.device, metric));
        for end in &state.ends {
            if end.kind == DeviceKind::Host {
                hosts.insert(end.device, end.ip);
            }
        }
    }

    let mut dist: BTreeMap<DeviceId, u64> = BTreeMap::new();
    let mut first_hop: BTreeMap<DeviceId, DeviceId> = BTreeMap::new();
    let mut heap = BinaryHeap::new();

    dist.insert(source, 0);
    heap.push(Reverse((0u64, source)));

    while let Some(Reverse((cost, vertex))) = heap.pop() {
        if dist.get(&vertex).is_some_and(|&best| cost > best) {
            continue;
        }
        if vertex != source && hosts.contains_key(&vertex) {
            continue;
        }
        let Some(edges) = adjacency.get(&vertex) else {
            continue;
        };

        for &(next, metric) in edges {
            let candidate = cost + metric;
            let hop = if vertex == source {
                next
            } else {
                first_hop[&vertex]
            };
            let better = match dist.get(&next) {
                None => true,
                Some(&known) => candidate < known,
            };
            if better {
                dist.insert(next, candidate);
                first_hop.insert(next, hop);
                heap.push(Reverse((candidate, next)));
            }
        }
    }

    hosts
        .into_iter()
        .filter(|(host, _)| *host != source)
        .filter_map(|(host, destination)| {
            Some(Route {
                destination,
                host,
                first_hop: *first_hop.get(&host)?,
                cost: dist[&host],
            })
        })
        .collect()
}

/// Resolves every route's first hop through the local interfaces. Routes
/// whose first hop is not a neighbour are left out.
pub fn derive_fib(routes: &[Route], interfaces: &Interfaces) -> BTreeMap<Ipv4Addr, LinkId> {
    let by_peer: BTreeMap<DeviceId, LinkId> =
        interfaces.iter().map(|i| (i.peer, i.link)).collect();

    routes
        .iter()
        .filter_map(|route| {
            by_peer
                .get(&route.first_hop)
                .map(|link| (route.destination, *link))
        })
        .collect()
}
