use crate::id::FlowId;
use crate::link::LinkState;
use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Destination address of flooded routing packets
pub const BROADCAST_IP: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
pub const INITIAL_TTL: u8 = 64;

pub const PACKET_SIZE: u32 = 1_000;
pub const HEADER_SIZE: u32 = 20;
pub const PAYLOAD_SIZE: u32 = PACKET_SIZE - HEADER_SIZE;
/// Size of Syn, SynAck and Ack packets
pub const CONTROL_SIZE: u32 = 64;
/// Size of LinkUp, LinkDown and LSA packets
pub const ROUTING_SIZE: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    Payload,
    Ack,
    Syn,
    SynAck,
    LinkUp,
    LinkDown,
    Lsa,
}

impl PacketType {
    pub fn is_routing(self) -> bool {
        matches!(self, PacketType::LinkUp | PacketType::LinkDown | PacketType::Lsa)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacketPayload {
    /// The link a LinkUp/LinkDown refers to
    Link(LinkState),
    /// A (partial) link-state database carried by an LSA
    Lsdb(Vec<LinkState>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Simulator-wide identity; copies made while flooding keep it
    pub id: u64,
    pub flow_id: FlowId,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub kind: PacketType,
    pub seq_num: u64,
    /// Size on the wire in bytes, header included
    pub size: u32,
    pub ttl: u8,
    pub payload: Option<PacketPayload>,
    /// Set when a link dequeues the packet
    pub sent_time: Option<SimTime>,
    /// Set when a link delivers the packet
    pub received_time: Option<SimTime>,
    /// Send timestamp stamped by the sender (Payload, Syn)
    pub ts_val: Option<SimTime>,
    /// Timestamp echoed back by the receiver (Ack, SynAck)
    pub ts_ecr: Option<SimTime>,
}

impl Packet {
    pub fn new(
        id: u64,
        flow_id: FlowId,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        kind: PacketType,
        seq_num: u64,
        size: u32,
    ) -> Self {
        Self {
            id,
            flow_id,
            src_ip,
            dst_ip,
            kind,
            seq_num,
            size,
            ttl: INITIAL_TTL,
            payload: None,
            sent_time: None,
            received_time: None,
            ts_val: None,
            ts_ecr: None,
        }
    }

    /// Creates a flooded routing packet
    pub fn routing(id: u64, kind: PacketType, payload: PacketPayload) -> Self {
        Self::new(
            id,
            FlowId::CONTROL,
            BROADCAST_IP,
            BROADCAST_IP,
            kind,
            0,
            ROUTING_SIZE,
        )
        .with_payload(payload)
    }

    pub fn with_payload(mut self, payload: PacketPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_ts_val(mut self, now: SimTime) -> Self {
        self.ts_val = Some(now);
        self
    }

    pub fn with_ts_ecr(mut self, echoed: Option<SimTime>) -> Self {
        self.ts_ecr = echoed;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst_ip == BROADCAST_IP
    }

    /// Bytes of application data carried (zero for everything but Payload)
    pub fn payload_bytes(&self) -> u32 {
        match self.kind {
            PacketType::Payload => self.size.saturating_sub(HEADER_SIZE),
            _ => 0,
        }
    }

    pub fn transit_time(&self) -> Option<SimTime> {
        match (self.sent_time, self.received_time) {
            (Some(sent), Some(received)) => Some(received.saturating_sub(sent)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_packets_are_broadcast() {
        let packet = Packet::routing(3, PacketType::Lsa, PacketPayload::Lsdb(Vec::new()));
        assert!(packet.is_broadcast());
        assert!(packet.kind.is_routing());
        assert_eq!(packet.size, ROUTING_SIZE);
        assert_eq!(packet.ttl, INITIAL_TTL);
        assert_eq!(packet.flow_id, FlowId::CONTROL);
    }

    #[test]
    fn payload_bytes_excludes_header() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let data = Packet::new(1, FlowId(1), ip, ip, PacketType::Payload, 0, PACKET_SIZE);
        let ack = Packet::new(2, FlowId(1), ip, ip, PacketType::Ack, 1, CONTROL_SIZE);
        assert_eq!(data.payload_bytes(), PAYLOAD_SIZE);
        assert_eq!(ack.payload_bytes(), 0);
    }
}
