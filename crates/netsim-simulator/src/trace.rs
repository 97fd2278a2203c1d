use crate::routing::Route;
use crate::stats::{FlowStats, LinkDirectionStats};
use netsim_abstract::{CongestionAlgorithm, FlowId, FlowStatus, LinkId, LinkParams, SimConfig};
use serde::Serialize;
use std::net::Ipv4Addr;

/// A compact textual summary of a notable simulation event.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub time: u64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub flow: FlowId,
    pub host: String,
    pub destination: Ipv4Addr,
    pub algorithm: CongestionAlgorithm,
    pub status: FlowStatus,
    pub data_bytes: u64,
    pub acked_bytes: u64,
    /// In-order bytes seen by the receiving host, if the flow got that far
    pub delivered_bytes: Option<u64>,
    pub retransmissions: u64,
    pub stalled: bool,
    pub completion_ms: Option<f64>,
    pub stats: FlowStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub link: LinkId,
    pub ends: [String; 2],
    pub params: LinkParams,
    /// `[a -> b, b -> a]`
    pub directions: [LinkDirectionStats; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct FibEntry {
    pub destination: Ipv4Addr,
    pub link: LinkId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterReport {
    pub router: String,
    /// Address of the first interface, if any
    pub address: Option<Ipv4Addr>,
    pub known_links: usize,
    pub routes: Vec<Route>,
    pub fib: Vec<FibEntry>,
    pub forwarded: u64,
    pub dropped_no_route: u64,
    pub dropped_ttl: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub config: SimConfig,
    pub duration_ms: f64,
    pub flows: Vec<FlowReport>,
    pub links: Vec<LinkReport>,
    pub routers: Vec<RouterReport>,
    pub events: Vec<EventSummary>,
    /// Events that did not fit in the bounded log
    pub events_dropped: u64,
}
