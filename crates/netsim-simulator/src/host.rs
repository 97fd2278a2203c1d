use crate::context::{DeviceContext, FlowContext, TimerKind};
use crate::device::Interfaces;
use crate::flow::Flow;
use crate::flow_received::FlowReceived;
use netsim_abstract::{DeviceId, FlowId, LinkId, LinkState, Packet, PacketType, SimTime};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// End system: owns the sending and receiving ends of its flows and sends
/// everything through its gateway interface.
#[derive(Debug)]
pub struct Host {
    id: DeviceId,
    label: String,
    interfaces: Interfaces,
    flows: BTreeMap<FlowId, Flow>,
    received: BTreeMap<FlowId, FlowReceived>,
    /// Packets that arrived for another address
    misaddressed: u64,
}

/// Gives a flow access to the network through the host's gateway.
struct HostPort<'a> {
    ctx: &'a mut dyn DeviceContext,
    host: DeviceId,
    gateway: Option<LinkId>,
}

impl FlowContext for HostPort<'_> {
    fn now(&self) -> SimTime {
        self.ctx.now()
    }

    fn next_packet_id(&mut self) -> u64 {
        self.ctx.next_packet_id()
    }

    fn send(&mut self, packet: Packet) {
        match self.gateway {
            Some(link) => self.ctx.transmit(link, packet),
            None => warn!(host = %self.host, flow = %packet.flow_id, "no gateway, packet dropped"),
        }
    }

    fn start_timer(&mut self, delay: SimTime, timer: TimerKind) {
        self.ctx.start_timer(delay, timer);
    }

    fn cancel_timer(&mut self, timer: TimerKind) {
        self.ctx.cancel_timer(timer);
    }

    fn log_event(&mut self, description: String) {
        self.ctx.log_event(description);
    }
}

impl Host {
    pub fn new(id: DeviceId, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            interfaces: Interfaces::default(),
            flows: BTreeMap::new(),
            received: BTreeMap::new(),
            misaddressed: 0,
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

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.interfaces.gateway().map(|i| i.ip)
    }

    pub fn flow(&self, flow: FlowId) -> Option<&Flow> {
        self.flows.get(&flow)
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn flow_received(&self, flow: FlowId) -> Option<&FlowReceived> {
        self.received.get(&flow)
    }

    pub fn misaddressed(&self) -> u64 {
        self.misaddressed
    }

    fn port<'a>(&self, ctx: &'a mut dyn DeviceContext) -> HostPort<'a> {
        HostPort {
            ctx,
            host: self.id,
            gateway: self.interfaces.gateway().map(|i| i.link),
        }
    }

    pub(crate) fn attach_link(&mut self, state: LinkState) {
        self.interfaces.attach(self.id, &state);
    }

    pub(crate) fn detach_link(&mut self, link: LinkId) {
        self.interfaces.detach(link);
    }

    pub(crate) fn start_flow(&mut self, ctx: &mut dyn DeviceContext, mut flow: Flow) {
        let mut port = self.port(ctx);
        flow.start(&mut port);
        self.flows.insert(flow.id(), flow);
    }

    pub(crate) fn receive(&mut self, ctx: &mut dyn DeviceContext, link: LinkId, packet: Packet) {
        if packet.kind.is_routing() {
            return;
        }
        if Some(packet.dst_ip) != self.ip() {
            self.misaddressed += 1;
            debug!(host = %self.id, %link, dst = %packet.dst_ip, "packet not for this host");
            return;
        }

        let mut port = self.port(ctx);
        match packet.kind {
            PacketType::Syn => {
                let receiver = self.received.entry(packet.flow_id).or_insert_with(|| {
                    FlowReceived::new(packet.flow_id, packet.dst_ip, packet.src_ip)
                });
                receiver.on_syn(&mut port, &packet);
            }
            PacketType::Payload => match self.received.get_mut(&packet.flow_id) {
                Some(receiver) => receiver.on_receive(&mut port, &packet),
                None => debug!(host = %self.id, flow = %packet.flow_id, "payload for unknown flow"),
            },
            PacketType::SynAck | PacketType::Ack => {
                if let Some(flow) = self.flows.get_mut(&packet.flow_id) {
                    flow.on_packet(&mut port, &packet);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn on_timer(&mut self, ctx: &mut dyn DeviceContext, timer: TimerKind) {
        let flow_id = match timer {
            TimerKind::FlowStart(id) | TimerKind::SynRetry(id) | TimerKind::Rto(id) => id,
        };
        let mut port = self.port(ctx);
        if let Some(flow) = self.flows.get_mut(&flow_id) {
            flow.on_timer(&mut port, timer);
        }
    }

    pub(crate) fn sample_stats(&mut self, now: SimTime, interval: SimTime) {
        for flow in self.flows.values_mut() {
            if flow.status().is_transferring() {
                flow.sample_stats(now, interval);
            }
        }
    }
}
