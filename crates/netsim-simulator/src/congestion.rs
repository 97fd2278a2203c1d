use netsim_abstract::{CongestionAlgorithm, FlowStatus, SimTime};

/// Lower bound of the slow-start threshold
pub const MIN_SSTHRESH: f64 = 2.0;

// Vegas thresholds, in packets of estimated queue
const VEGAS_ALPHA: f64 = 2.0;
const VEGAS_BETA: f64 = 4.0;
const VEGAS_GAMMA: f64 = 1.0;

// FAST parameters
const FAST_ALPHA: f64 = 4.0;
const FAST_GAMMA: f64 = 0.5;

/// Window state shared between a flow and its strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct CongestionState {
    /// Congestion window in packets
    pub cwnd: f64,
    pub ssthresh: f64,
    pub status: FlowStatus,
    /// 1 after a new ACK, incremented by every duplicate
    pub dup_acks: u32,
    /// Smoothed RTT in microseconds
    pub rtt: Option<f64>,
    /// Smallest RTT sample in microseconds
    pub rtt_min: Option<f64>,
    /// Time of the ACK being processed
    pub now: SimTime,
}

impl Default for CongestionState {
    fn default() -> Self {
        Self {
            cwnd: 1.0,
            ssthresh: f64::MAX,
            status: FlowStatus::Waiting,
            dup_acks: 0,
            rtt: None,
            rtt_min: None,
            now: 0,
        }
    }
}

impl CongestionState {
    /// Estimated number of this flow's packets sitting in queues:
    /// `(cwnd/RTTmin - cwnd/RTT) * RTTmin`.
    pub fn queue_estimate(&self) -> Option<f64> {
        match (self.rtt, self.rtt_min) {
            (Some(rtt), Some(base)) if rtt > 0.0 && base > 0.0 => {
                Some((self.cwnd / base - self.cwnd / rtt) * base)
            }
            _ => None,
        }
    }

    fn check_invariants(&self) {
        debug_assert!(self.cwnd >= 1.0, "cwnd fell below 1: {}", self.cwnd);
        debug_assert!(
            self.ssthresh >= MIN_SSTHRESH,
            "ssthresh fell below {MIN_SSTHRESH}: {}",
            self.ssthresh
        );
    }
}

pub trait CongestionControl: std::fmt::Debug {
    fn on_new_ack(&mut self, state: &mut CongestionState);
    fn on_dup_ack(&mut self, state: &mut CongestionState);
}

pub fn for_algorithm(algorithm: CongestionAlgorithm) -> Box<dyn CongestionControl> {
    match algorithm {
        CongestionAlgorithm::Tahoe => Box::new(Tahoe),
        CongestionAlgorithm::Reno => Box::new(Reno),
        CongestionAlgorithm::Vegas => Box::new(Vegas::default()),
        CongestionAlgorithm::Fast => Box::new(Fast::default()),
    }
}

/// Grows the window by one packet and leaves slow start at `ssthresh`.
pub fn slow_start(state: &mut CongestionState) {
    state.cwnd += 1.0;
    if state.cwnd >= state.ssthresh {
        state.status = FlowStatus::CongestionAvoidance;
    }
}

/// Grows the window by roughly one packet per round trip.
pub fn additive_increase(state: &mut CongestionState) {
    state.cwnd += 1.0 / state.cwnd;
}

/// Reno-style new ACK: deflate after recovery, otherwise grow.
pub fn reno_new_ack(state: &mut CongestionState) {
    match state.status {
        FlowStatus::FastRecovery => {
            state.cwnd = state.ssthresh.max(1.0);
            state.status = FlowStatus::CongestionAvoidance;
        }
        FlowStatus::SlowStart => slow_start(state),
        FlowStatus::CongestionAvoidance => additive_increase(state),
        _ => {}
    }
}

/// Reno-style duplicate ACK: enter fast recovery on the third, inflate
/// the window for each one after that.
pub fn reno_dup_ack(state: &mut CongestionState) {
    if state.dup_acks == 3 {
        state.cwnd = state.ssthresh + 3.0;
        state.status = FlowStatus::FastRecovery;
    } else if state.dup_acks > 3 && state.status == FlowStatus::FastRecovery {
        state.cwnd += 1.0;
    }
}

#[derive(Debug, Default)]
pub struct Tahoe;

impl CongestionControl for Tahoe {
    fn on_new_ack(&mut self, state: &mut CongestionState) {
        match state.status {
            FlowStatus::SlowStart => slow_start(state),
            FlowStatus::CongestionAvoidance => additive_increase(state),
            _ => {}
        }
        state.check_invariants();
    }

    fn on_dup_ack(&mut self, state: &mut CongestionState) {
        if state.dup_acks == 3 {
            state.cwnd = 1.0;
            state.status = FlowStatus::SlowStart;
        }
        state.check_invariants();
    }
}

#[derive(Debug, Default)]
pub struct Reno;

impl CongestionControl for Reno {
    fn on_new_ack(&mut self, state: &mut CongestionState) {
        reno_new_ack(state);
        state.check_invariants();
    }

    fn on_dup_ack(&mut self, state: &mut CongestionState) {
        reno_dup_ack(state);
        state.check_invariants();
    }
}

/// Delay-based control: the window only grows while the estimated queue
/// stays small.
#[derive(Debug, Default)]
pub struct Vegas {
    probing: bool,
    last_toggle: Option<SimTime>,
}

impl Vegas {
    // Flips between probing and holding once per RTT
    fn toggle_probe(&mut self, state: &CongestionState) {
        let rtt = state.rtt.unwrap_or(0.0);
        match self.last_toggle {
            None => {
                self.probing = true;
                self.last_toggle = Some(state.now);
            }
            Some(last) if (state.now.saturating_sub(last)) as f64 >= rtt => {
                self.probing = !self.probing;
                self.last_toggle = Some(state.now);
            }
            Some(_) => {}
        }
    }

    fn slow_start(&mut self, state: &mut CongestionState) {
        self.toggle_probe(state);
        if self.probing {
            state.cwnd += 1.0;
        }

        let queue_building = state.queue_estimate().is_some_and(|diff| diff > VEGAS_GAMMA);
        if state.cwnd >= state.ssthresh || queue_building {
            state.status = FlowStatus::CongestionAvoidance;
        }
    }

    fn avoid_congestion(&mut self, state: &mut CongestionState) {
        match state.queue_estimate() {
            Some(diff) if diff < VEGAS_ALPHA => additive_increase(state),
            Some(diff) if diff > VEGAS_BETA => {
                state.cwnd = (state.cwnd - 1.0 / state.cwnd).max(1.0);
            }
            Some(_) => {}
            None => additive_increase(state),
        }
    }
}

impl CongestionControl for Vegas {
    fn on_new_ack(&mut self, state: &mut CongestionState) {
        match state.status {
            FlowStatus::FastRecovery => reno_new_ack(state),
            FlowStatus::SlowStart => self.slow_start(state),
            FlowStatus::CongestionAvoidance => self.avoid_congestion(state),
            _ => {}
        }
        state.check_invariants();
    }

    fn on_dup_ack(&mut self, state: &mut CongestionState) {
        reno_dup_ack(state);
        state.check_invariants();
    }
}

/// FAST TCP: Vegas slow start and recovery; in congestion avoidance the
/// window moves towards an equilibrium target, alternating between an RTT
/// spent measuring and an RTT spent applying the change.
#[derive(Debug, Default)]
pub struct Fast {
    vegas: Vegas,
    applying: bool,
    last_switch: Option<SimTime>,
    change_target: f64,
}

impl Fast {
    fn measure(&mut self, state: &CongestionState) {
        let (Some(rtt), Some(base)) = (state.rtt, state.rtt_min) else {
            self.change_target = 0.0;
            return;
        };
        let w = state.cwnd;
        let target = ((1.0 - FAST_GAMMA) * w + FAST_GAMMA * (base / rtt * w + FAST_ALPHA)).min(2.0 * w);
        self.change_target = (target - w).clamp(-w / 2.0, w);
    }

    fn avoid_congestion(&mut self, state: &mut CongestionState) {
        let rtt = state.rtt.unwrap_or(0.0);
        match self.last_switch {
            None => {
                // Entering congestion avoidance: measure and apply at once
                self.measure(state);
                self.applying = true;
                self.last_switch = Some(state.now);
            }
            Some(last) if (state.now.saturating_sub(last)) as f64 >= rtt => {
                if self.applying {
                    self.measure(state);
                }
                self.applying = !self.applying;
                self.last_switch = Some(state.now);
            }
            Some(_) => {}
        }

        if self.applying {
            state.cwnd = (state.cwnd + self.change_target / state.cwnd).max(1.0);
        }
    }
}

impl CongestionControl for Fast {
    fn on_new_ack(&mut self, state: &mut CongestionState) {
        match state.status {
            FlowStatus::CongestionAvoidance => self.avoid_congestion(state),
            _ => self.vegas.on_new_ack(state),
        }
        state.check_invariants();
    }

    fn on_dup_ack(&mut self, state: &mut CongestionState) {
        reno_dup_ack(state);
        state.check_invariants();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: FlowStatus, cwnd: f64, ssthresh: f64) -> CongestionState {
        CongestionState {
            cwnd,
            ssthresh,
            status,
            dup_acks: 1,
            ..Default::default()
        }
    }

    #[test]
    fn tahoe_slow_start_then_additive_increase() {
        let mut tahoe = Tahoe;
        let mut s = state(FlowStatus::SlowStart, 3.0, 4.0);

        tahoe.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 4.0);
        assert_eq!(s.status, FlowStatus::CongestionAvoidance);

        tahoe.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 4.25);
    }

    #[test]
    fn tahoe_triple_dup_resets_window() {
        let mut tahoe = Tahoe;
        let mut s = state(FlowStatus::CongestionAvoidance, 12.0, 8.0);
        s.dup_acks = 3;
        tahoe.on_dup_ack(&mut s);
        assert_eq!(s.cwnd, 1.0);
        assert_eq!(s.status, FlowStatus::SlowStart);
    }

    #[test]
    fn reno_fast_recovery_cycle() {
        let mut reno = Reno;
        let mut s = state(FlowStatus::CongestionAvoidance, 9.0, 10.0);

        s.dup_acks = 3;
        reno.on_dup_ack(&mut s);
        assert_eq!(s.cwnd, 13.0);
        assert_eq!(s.status, FlowStatus::FastRecovery);

        s.dup_acks = 4;
        reno.on_dup_ack(&mut s);
        assert_eq!(s.cwnd, 14.0);

        s.ssthresh = 4.0;
        s.dup_acks = 1;
        reno.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 4.0);
        assert_eq!(s.status, FlowStatus::CongestionAvoidance);
    }

    #[test]
    fn vegas_leaves_slow_start_when_queue_builds() {
        let mut vegas = Vegas::default();
        let mut s = state(FlowStatus::SlowStart, 10.0, f64::MAX);
        s.rtt_min = Some(20_000.0);
        s.rtt = Some(40_000.0);

        vegas.on_new_ack(&mut s);

        // Probing on the first ACK, then the queue estimate (5.5) exceeds gamma
        assert_eq!(s.cwnd, 11.0);
        assert_eq!(s.status, FlowStatus::CongestionAvoidance);
    }

    #[test]
    fn vegas_probes_every_other_rtt() {
        let mut vegas = Vegas::default();
        let mut s = state(FlowStatus::SlowStart, 2.0, f64::MAX);
        s.rtt = Some(1_000.0);
        s.rtt_min = Some(1_000.0);

        s.now = 0;
        vegas.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 3.0);

        // Same RTT interval: still probing
        s.now = 500;
        vegas.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 4.0);

        // Next interval: holding
        s.now = 1_000;
        vegas.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 4.0);

        s.now = 2_000;
        vegas.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 5.0);
    }

    #[test]
    fn vegas_congestion_avoidance_thresholds() {
        let mut vegas = Vegas::default();

        // No queue: increase
        let mut s = state(FlowStatus::CongestionAvoidance, 4.0, 4.0);
        s.rtt = Some(10_000.0);
        s.rtt_min = Some(10_000.0);
        vegas.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 4.25);

        // Estimate 5 > beta: decrease
        let mut s = state(FlowStatus::CongestionAvoidance, 10.0, 4.0);
        s.rtt = Some(20_000.0);
        s.rtt_min = Some(10_000.0);
        vegas.on_new_ack(&mut s);
        assert!((s.cwnd - 9.9).abs() < 1e-9);

        // Estimate 3, between alpha and beta: hold
        let mut s = state(FlowStatus::CongestionAvoidance, 6.0, 4.0);
        s.rtt = Some(20_000.0);
        s.rtt_min = Some(10_000.0);
        vegas.on_new_ack(&mut s);
        assert_eq!(s.cwnd, 6.0);
    }

    #[test]
    fn vegas_never_shrinks_below_one() {
        let mut vegas = Vegas::default();
        let mut s = state(FlowStatus::CongestionAvoidance, 1.0, 2.0);
        s.rtt = Some(1_000_000.0);
        s.rtt_min = Some(1.0);
        for _ in 0..10 {
            vegas.on_new_ack(&mut s);
        }
        assert!(s.cwnd >= 1.0);
    }

    #[test]
    fn fast_alternates_measure_and_apply() {
        let mut fast = Fast::default();
        let mut s = state(FlowStatus::CongestionAvoidance, 10.0, 4.0);
        s.rtt = Some(1_000.0);
        s.rtt_min = Some(1_000.0);

        // First half-cycle measures an increase (no queueing) and applies it
        s.now = 0;
        fast.on_new_ack(&mut s);
        assert!(s.cwnd > 10.0);
        let after_first = s.cwnd;

        // Next RTT: measurement half-cycle, window held
        s.now = 1_000;
        fast.on_new_ack(&mut s);
        assert_eq!(s.cwnd, after_first);

        // Following RTT: apply again
        s.now = 2_000;
        fast.on_new_ack(&mut s);
        assert!(s.cwnd > after_first);
    }

    #[test]
    fn fast_uses_reno_recovery() {
        let mut fast = Fast::default();
        let mut s = state(FlowStatus::CongestionAvoidance, 8.0, 10.0);
        s.dup_acks = 3;
        fast.on_dup_ack(&mut s);
        assert_eq!(s.cwnd, 13.0);
        assert_eq!(s.status, FlowStatus::FastRecovery);
    }
}
