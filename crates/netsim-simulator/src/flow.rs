use crate::congestion::{self, CongestionControl, CongestionState, MIN_SSTHRESH};
use crate::context::{FlowContext, TimerKind};
use crate::flow_received::INITIAL_SEQ;
use crate::stats::FlowStats;
use netsim_abstract::packet::{CONTROL_SIZE, HEADER_SIZE, PAYLOAD_SIZE};
use netsim_abstract::time::{MICROS_PER_MS, as_millis_f64};
use netsim_abstract::{
    CongestionAlgorithm, FlowId, FlowStatus, Packet, PacketType, SimConfig, SimTime,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Weight of a new RTT sample in the smoothed RTT
const RTT_ALPHA: f64 = 0.125;
/// RTO as a multiple of the smoothed RTT
const RTO_BETA: f64 = 2.0;
/// Duplicate-ACK count that triggers fast retransmit
const DUP_ACK_THRESHOLD: u32 = 3;

/// Retransmission settings copied from [`SimConfig`] when the flow is created.
#[derive(Debug, Clone, Copy)]
struct RetransmitLimits {
    initial_rto: SimTime,
    min_rto: SimTime,
    max_rto: SimTime,
    max_syn_retries: u32,
    max_consecutive_timeouts: u32,
}

impl From<&SimConfig> for RetransmitLimits {
    fn from(config: &SimConfig) -> Self {
        Self {
            initial_rto: config.initial_rto_ms * MICROS_PER_MS,
            min_rto: config.min_rto_ms * MICROS_PER_MS,
            max_rto: config.max_rto_ms * MICROS_PER_MS,
            max_syn_retries: config.max_syn_retries,
            max_consecutive_timeouts: config.max_consecutive_timeouts,
        }
    }
}

/// Sending end of a transfer. Window growth is delegated to a
/// [`CongestionControl`] strategy.
#[derive(Debug)]
pub struct Flow {
    id: FlowId,
    source_ip: Ipv4Addr,
    destination: Ipv4Addr,
    algorithm: CongestionAlgorithm,
    data_bytes: u64,
    data_remaining: u64,
    start_delay: SimTime,

    cc: CongestionState,
    controller: Box<dyn CongestionControl>,
    limits: RetransmitLimits,

    rto: SimTime,
    rto_armed: bool,
    syn_retries: u32,
    time_syn: Option<SimTime>,
    consecutive_timeouts: u32,
    /// Gave up retrying (handshake or data)
    stalled: bool,

    /// Lowest unacknowledged sequence number
    window_start: u64,
    /// Highest cumulative ACK seen
    max_ack: u64,
    next_seq: u64,
    in_flight: BTreeMap<u64, Packet>,

    acked_bytes: u64,
    retransmissions: u64,
    started_at: Option<SimTime>,
    completed_at: Option<SimTime>,
    pub stats: FlowStats,
}

impl Flow {
    pub fn new(
        id: FlowId,
        source_ip: Ipv4Addr,
        destination: Ipv4Addr,
        algorithm: CongestionAlgorithm,
        data_bytes: u64,
        start_delay: SimTime,
        config: &SimConfig,
    ) -> Self {
        let limits = RetransmitLimits::from(config);
        Self {
            id,
            source_ip,
            destination,
            algorithm,
            data_bytes,
            data_remaining: data_bytes,
            start_delay,
            cc: CongestionState::default(),
            controller: congestion::for_algorithm(algorithm),
            limits,
            rto: limits.initial_rto,
            rto_armed: false,
            syn_retries: 0,
            time_syn: None,
            consecutive_timeouts: 0,
            stalled: false,
            window_start: INITIAL_SEQ,
            max_ack: INITIAL_SEQ,
            next_seq: INITIAL_SEQ,
            in_flight: BTreeMap::new(),
            acked_bytes: 0,
            retransmissions: 0,
            started_at: None,
            completed_at: None,
            stats: FlowStats::new(config.stats_retention),
        }
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn algorithm(&self) -> CongestionAlgorithm {
        self.algorithm
    }

    pub fn status(&self) -> FlowStatus {
        self.cc.status
    }

    pub fn cwnd(&self) -> f64 {
        self.cc.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.cc.ssthresh
    }

    /// Smoothed RTT in microseconds
    pub fn rtt(&self) -> Option<f64> {
        self.cc.rtt
    }

    pub fn rto(&self) -> SimTime {
        self.rto
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn started_at(&self) -> Option<SimTime> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<SimTime> {
        self.completed_at
    }

    /// Begins the flow: waits out the start delay, then sends the SYN.
    pub fn start(&mut self, ctx: &mut dyn FlowContext) {
        self.cc.status = FlowStatus::Waiting;
        if self.start_delay > 0 {
            ctx.start_timer(self.start_delay, TimerKind::FlowStart(self.id));
        } else {
            self.handshake(ctx);
        }
    }

    pub fn on_timer(&mut self, ctx: &mut dyn FlowContext, timer: TimerKind) {
        match timer {
            TimerKind::FlowStart(_) => {
                if self.cc.status == FlowStatus::Waiting {
                    self.handshake(ctx);
                }
            }
            TimerKind::SynRetry(_) => self.on_syn_timeout(ctx),
            TimerKind::Rto(_) => self.on_rto(ctx),
        }
    }

    pub fn on_packet(&mut self, ctx: &mut dyn FlowContext, packet: &Packet) {
        match packet.kind {
            PacketType::SynAck => self.on_syn_ack(ctx, packet),
            PacketType::Ack => self.on_ack(ctx, packet),
            other => debug!(flow = %self.id, kind = ?other, "sender ignores packet"),
        }
    }

    fn set_status(&mut self, ctx: &mut dyn FlowContext, status: FlowStatus) {
        if self.cc.status != status {
            self.cc.status = status;
            self.log_status(ctx);
        }
    }

    fn log_status(&self, ctx: &mut dyn FlowContext) {
        info!(flow = %self.id, status = %self.cc.status, cwnd = self.cc.cwnd, "flow state");
        ctx.log_event(format!(
            "{} -> {} (cwnd {:.2}, ssthresh {:.2})",
            self.id, self.cc.status, self.cc.cwnd, self.cc.ssthresh
        ));
    }

    fn handshake(&mut self, ctx: &mut dyn FlowContext) {
        self.started_at = Some(ctx.now());
        self.set_status(ctx, FlowStatus::HandShake);
        self.syn_retries = 0;
        self.send_syn(ctx);
        ctx.start_timer(self.limits.initial_rto, TimerKind::SynRetry(self.id));
    }

    fn send_syn(&mut self, ctx: &mut dyn FlowContext) {
        let now = ctx.now();
        self.time_syn = Some(now);
        let id = ctx.next_packet_id();
        let syn = Packet::new(
            id,
            self.id,
            self.source_ip,
            self.destination,
            PacketType::Syn,
            0,
            CONTROL_SIZE,
        )
        .with_ts_val(now);
        ctx.send(syn);
    }

    fn on_syn_timeout(&mut self, ctx: &mut dyn FlowContext) {
        if self.cc.status != FlowStatus::HandShake {
            return;
        }
        if self.syn_retries >= self.limits.max_syn_retries {
            self.stalled = true;
            warn!(flow = %self.id, retries = self.syn_retries, "handshake abandoned");
            ctx.log_event(format!("{} handshake abandoned", self.id));
            return;
        }

        self.syn_retries += 1;
        self.send_syn(ctx);
        let backoff = self
            .limits
            .initial_rto
            .saturating_mul(1 << self.syn_retries.min(20))
            .min(self.limits.max_rto);
        ctx.start_timer(backoff, TimerKind::SynRetry(self.id));
    }

    fn on_syn_ack(&mut self, ctx: &mut dyn FlowContext, packet: &Packet) {
        if self.cc.status != FlowStatus::HandShake {
            return;
        }
        ctx.cancel_timer(TimerKind::SynRetry(self.id));
        self.stalled = false;

        let now = ctx.now();
        if let Some(sent) = packet.ts_ecr.or(self.time_syn) {
            self.sample_rtt(now.saturating_sub(sent));
        }

        let id = ctx.next_packet_id();
        let ack = Packet::new(
            id,
            self.id,
            self.source_ip,
            self.destination,
            PacketType::Ack,
            INITIAL_SEQ,
            CONTROL_SIZE,
        );
        ctx.send(ack);

        self.cc.dup_acks = 1;
        self.set_status(ctx, FlowStatus::SlowStart);
        self.send(ctx);
    }

    fn on_ack(&mut self, ctx: &mut dyn FlowContext, packet: &Packet) {
        if !self.cc.status.is_transferring() {
            return;
        }
        let now = ctx.now();
        self.cc.now = now;
        if let Some(echoed) = packet.ts_ecr {
            self.sample_rtt(now.saturating_sub(echoed));
        }

        let ack = packet.seq_num;
        let outstanding = self.in_flight.split_off(&ack);
        let released = std::mem::replace(&mut self.in_flight, outstanding);
        let released_bytes: u64 = released.values().map(|p| p.payload_bytes() as u64).sum();
        self.acked_bytes += released_bytes;
        self.stats.record_acked(released_bytes);
        self.window_start = self.window_start.max(ack);

        if self.in_flight.is_empty() && self.data_remaining == 0 {
            self.complete(ctx);
            return;
        }

        let before = self.cc.status;
        if ack > self.max_ack {
            self.max_ack = ack;
            self.cc.dup_acks = 1;
            self.consecutive_timeouts = 0;
            self.stalled = false;
            self.arm_rto(ctx);
            self.controller.on_new_ack(&mut self.cc);
        } else {
            self.cc.dup_acks += 1;
            self.controller.on_dup_ack(&mut self.cc);
            if self.cc.dup_acks == DUP_ACK_THRESHOLD {
                debug!(flow = %self.id, seq = self.window_start, "fast retransmit");
                self.retransmit_oldest(ctx);
                self.collapse_ssthresh();
            }
        }
        if self.cc.status != before {
            self.log_status(ctx);
        }

        self.send(ctx);
    }

    fn on_rto(&mut self, ctx: &mut dyn FlowContext) {
        self.rto_armed = false;
        if !self.cc.status.is_transferring() || self.in_flight.is_empty() {
            return;
        }

        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts > self.limits.max_consecutive_timeouts {
            self.stalled = true;
            warn!(flow = %self.id, timeouts = self.consecutive_timeouts - 1, "flow stalled");
            ctx.log_event(format!("{} stalled after repeated timeouts", self.id));
            return;
        }
        debug!(flow = %self.id, rto = self.rto, "retransmission timeout");

        self.retransmit_oldest(ctx);
        self.collapse_ssthresh();
        self.rto = self.rto.saturating_mul(2).min(self.limits.max_rto);
        self.cc.cwnd = 1.0;
        self.cc.dup_acks = 0;
        self.set_status(ctx, FlowStatus::SlowStart);

        // Go back: everything after the oldest segment is sent again
        if let Some(&oldest) = self.in_flight.keys().next() {
            self.next_seq = oldest + 1;
        }
        self.arm_rto(ctx);
        self.send(ctx);
    }

    /// Sends as many segments as the window allows, re-sending stored
    /// segments the window moved back over before creating new ones.
    fn send(&mut self, ctx: &mut dyn FlowContext) {
        self.next_seq = self.next_seq.max(self.window_start);
        let mut sent_any = false;

        while (self.next_seq as f64) < self.window_start as f64 + self.cc.cwnd {
            let seq = self.next_seq;
            let now = ctx.now();
            let packet = if let Some(stored) = self.in_flight.get_mut(&seq) {
                stored.id = ctx.next_packet_id();
                stored.ts_val = Some(now);
                self.retransmissions += 1;
                stored.clone()
            } else if self.data_remaining > 0 {
                let chunk = self.data_remaining.min(PAYLOAD_SIZE as u64);
                self.data_remaining -= chunk;
                let id = ctx.next_packet_id();
                let packet = Packet::new(
                    id,
                    self.id,
                    self.source_ip,
                    self.destination,
                    PacketType::Payload,
                    seq,
                    HEADER_SIZE + chunk as u32,
                )
                .with_ts_val(now);
                self.in_flight.insert(seq, packet.clone());
                packet
            } else {
                break;
            };

            ctx.send(packet);
            self.next_seq += 1;
            sent_any = true;
        }

        if sent_any && !self.rto_armed {
            self.arm_rto(ctx);
        }
    }

    fn retransmit_oldest(&mut self, ctx: &mut dyn FlowContext) {
        let now = ctx.now();
        if let Some(oldest) = self.in_flight.values_mut().next() {
            oldest.id = ctx.next_packet_id();
            oldest.ts_val = Some(now);
            self.retransmissions += 1;
            ctx.send(oldest.clone());
        }
    }

    /// `ssthresh = max(flight / 2, 2)`, shared by every strategy.
    fn collapse_ssthresh(&mut self) {
        let flight = self.in_flight.len() as f64;
        self.cc.ssthresh = (flight / 2.0).floor().max(MIN_SSTHRESH);
    }

    fn arm_rto(&mut self, ctx: &mut dyn FlowContext) {
        ctx.start_timer(self.rto, TimerKind::Rto(self.id));
        self.rto_armed = true;
    }

    fn sample_rtt(&mut self, sample: SimTime) {
        let sample = sample as f64;
        let rtt = match self.cc.rtt {
            Some(old) => (1.0 - RTT_ALPHA) * old + RTT_ALPHA * sample,
            None => sample,
        };
        self.cc.rtt = Some(rtt);
        self.cc.rtt_min = Some(self.cc.rtt_min.map_or(sample, |min| min.min(sample)));
        self.rto = ((RTO_BETA * rtt).ceil() as SimTime)
            .max(self.limits.min_rto)
            .min(self.limits.max_rto);
    }

    fn complete(&mut self, ctx: &mut dyn FlowContext) {
        ctx.cancel_timer(TimerKind::Rto(self.id));
        ctx.cancel_timer(TimerKind::SynRetry(self.id));
        self.rto_armed = false;
        self.completed_at = Some(ctx.now());
        self.set_status(ctx, FlowStatus::Complete);

        let elapsed = self
            .started_at
            .map(|start| as_millis_f64(ctx.now().saturating_sub(start)))
            .unwrap_or_default();
        info!(
            flow = %self.id,
            bytes = self.acked_bytes,
            elapsed_ms = elapsed,
            retransmissions = self.retransmissions,
            "flow complete"
        );
    }

    pub fn sample_stats(&mut self, now: SimTime, interval: SimTime) {
        self.stats.sample(now, interval, self.cc.cwnd, self.cc.rtt);
    }
}
