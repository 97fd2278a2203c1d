use crate::context::FlowContext;
use netsim_abstract::packet::CONTROL_SIZE;
use netsim_abstract::{FlowId, Packet, PacketType};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// First data sequence number
pub const INITIAL_SEQ: u64 = 1;

/// Receiving end of a flow: cumulative, in-order acknowledgement.
#[derive(Debug, Clone)]
pub struct FlowReceived {
    flow_id: FlowId,
    local_ip: Ipv4Addr,
    peer_ip: Ipv4Addr,
    /// Out-of-order segments above `next_ack`, with their payload sizes
    pending: BTreeMap<u64, u32>,
    next_ack: u64,
    delivered_bytes: u64,
    duplicates: u64,
}

impl FlowReceived {
    pub fn new(flow_id: FlowId, local_ip: Ipv4Addr, peer_ip: Ipv4Addr) -> Self {
        Self {
            flow_id,
            local_ip,
            peer_ip,
            pending: BTreeMap::new(),
            next_ack: INITIAL_SEQ,
            delivered_bytes: 0,
            duplicates: 0,
        }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn peer_ip(&self) -> Ipv4Addr {
        self.peer_ip
    }

    /// Lowest sequence number not received yet
    pub fn next_ack(&self) -> u64 {
        self.next_ack
    }

    /// Payload bytes received in order
    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Answers a (possibly repeated) SYN.
    pub fn on_syn(&mut self, ctx: &mut dyn FlowContext, syn: &Packet) {
        let id = ctx.next_packet_id();
        let reply = Packet::new(
            id,
            self.flow_id,
            self.local_ip,
            self.peer_ip,
            PacketType::SynAck,
            0,
            CONTROL_SIZE,
        )
        .with_ts_ecr(syn.ts_val);
        ctx.send(reply);
    }

    pub fn on_receive(&mut self, ctx: &mut dyn FlowContext, packet: &Packet) {
        let seq = packet.seq_num;
        if seq < self.next_ack || self.pending.contains_key(&seq) {
            self.duplicates += 1;
        } else {
            self.pending.insert(seq, packet.payload_bytes());
        }

        while let Some(bytes) = self.pending.remove(&self.next_ack) {
            self.delivered_bytes += bytes as u64;
            self.next_ack += 1;
        }

        let id = ctx.next_packet_id();
        let ack = Packet::new(
            id,
            self.flow_id,
            self.local_ip,
            self.peer_ip,
            PacketType::Ack,
            self.next_ack,
            CONTROL_SIZE,
        )
        .with_ts_ecr(packet.ts_val);
        ctx.send(ack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::RecordingContext;
    use netsim_abstract::packet::{HEADER_SIZE, PACKET_SIZE, PAYLOAD_SIZE};

    const SENDER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const RECEIVER: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn segment(seq: u64, ts: u64) -> Packet {
        Packet::new(0, FlowId(1), SENDER, RECEIVER, PacketType::Payload, seq, PACKET_SIZE)
            .with_ts_val(ts)
    }

    #[test]
    fn acks_cumulatively_and_echoes_timestamp() {
        let mut ctx = RecordingContext::default();
        let mut rx = FlowReceived::new(FlowId(1), RECEIVER, SENDER);

        rx.on_receive(&mut ctx, &segment(1, 100));
        rx.on_receive(&mut ctx, &segment(3, 200));
        rx.on_receive(&mut ctx, &segment(2, 300));

        let acks: Vec<_> = ctx.take_sent().iter().map(|p| (p.seq_num, p.ts_ecr)).collect();
        assert_eq!(acks, vec![(2, Some(100)), (2, Some(200)), (4, Some(300))]);
        assert_eq!(rx.delivered_bytes(), 3 * PAYLOAD_SIZE as u64);
    }

    #[test]
    fn next_ack_never_regresses() {
        let mut ctx = RecordingContext::default();
        let mut rx = FlowReceived::new(FlowId(1), RECEIVER, SENDER);

        let arrivals = [5, 1, 1, 3, 2, 2, 7, 4, 1, 6, 5, 9, 8, 3];
        let mut last = rx.next_ack();
        for seq in arrivals {
            rx.on_receive(&mut ctx, &segment(seq, 0));
            assert!(rx.next_ack() >= last);
            last = rx.next_ack();
        }
        assert_eq!(rx.next_ack(), 10);
        assert_eq!(rx.delivered_bytes(), 9 * PAYLOAD_SIZE as u64);
        assert_eq!(rx.duplicates(), 5);
    }

    #[test]
    fn short_final_segment_counts_its_payload() {
        let mut ctx = RecordingContext::default();
        let mut rx = FlowReceived::new(FlowId(1), RECEIVER, SENDER);
        let tail = Packet::new(0, FlowId(1), SENDER, RECEIVER, PacketType::Payload, 1, HEADER_SIZE + 20);
        rx.on_receive(&mut ctx, &tail);
        assert_eq!(rx.delivered_bytes(), 20);
    }

    #[test]
    fn syn_gets_syn_ack() {
        let mut ctx = RecordingContext::default();
        let mut rx = FlowReceived::new(FlowId(4), RECEIVER, SENDER);
        let syn = Packet::new(0, FlowId(4), SENDER, RECEIVER, PacketType::Syn, 0, CONTROL_SIZE)
            .with_ts_val(42);

        rx.on_syn(&mut ctx, &syn);
        rx.on_syn(&mut ctx, &syn);

        let sent = ctx.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|p| p.kind == PacketType::SynAck && p.dst_ip == SENDER));
        assert_eq!(sent[0].ts_ecr, Some(42));
        assert_eq!(rx.next_ack(), INITIAL_SEQ);
    }
}
