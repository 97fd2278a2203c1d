//! Capabilities handed to devices and flows while they handle an event.
//!
//! Handlers never touch the simulator directly. Everything they want to
//! happen (transmissions, timers, route rebuilds) is recorded in an
//! [`ActionBuffer`] and applied by the engine once the handler returns.

use netsim_abstract::{FlowId, LinkId, Packet, SimTime};

/// Timers a device can arm. At most one timer per `(device, kind)` is
/// pending at any time: arming again replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Start delay of a flow has elapsed
    FlowStart(FlowId),
    /// No SynAck arrived in time
    SynRetry(FlowId),
    /// Retransmission timeout
    Rto(FlowId),
}

/// What a device may do while handling an event.
pub trait DeviceContext {
    /// Current simulation time
    fn now(&self) -> SimTime;

    /// Allocates a fresh packet identity.
    fn next_packet_id(&mut self) -> u64;

    /// Hands a packet to the given link, from the device being handled.
    fn transmit(&mut self, link: LinkId, packet: Packet);

    /// Arms (or re-arms) a timer that fires after `delay`.
    fn start_timer(&mut self, delay: SimTime, timer: TimerKind);

    /// Cancels a timer. Cancelling a timer that is not armed is a no-op.
    fn cancel_timer(&mut self, timer: TimerKind);

    /// Asks for the device's routing table to be rebuilt. Requests made at
    /// the same instant are coalesced.
    fn request_route_rebuild(&mut self);

    /// Adds a line to the simulation's event log.
    fn log_event(&mut self, description: String);
}

/// What a transport endpoint (sender or receiver side) may do. Packets are
/// sent through the owning host's gateway.
pub trait FlowContext {
    fn now(&self) -> SimTime;
    fn next_packet_id(&mut self) -> u64;
    fn send(&mut self, packet: Packet);
    fn start_timer(&mut self, delay: SimTime, timer: TimerKind);
    fn cancel_timer(&mut self, timer: TimerKind);
    fn log_event(&mut self, description: String);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerOp {
    Start(SimTime, TimerKind),
    Cancel(TimerKind),
}

/// Actions buffered during a handler call
#[derive(Debug, Default)]
pub(crate) struct ActionBuffer {
    pub(crate) outgoing_packets: Vec<(LinkId, Packet)>,
    // Kept in call order: a restart followed by a cancel must end cancelled
    pub(crate) timer_ops: Vec<TimerOp>,
    pub(crate) rebuild_routes: bool,
    pub(crate) events: Vec<String>,
}

/// Context implementation passed to devices
pub(crate) struct ScopedContext<'a> {
    pub(crate) buffer: &'a mut ActionBuffer,
    pub(crate) now: SimTime,
    pub(crate) packet_ids: &'a mut u64,
}

impl DeviceContext for ScopedContext<'_> {
    fn now(&self) -> SimTime {
        self.now
    }

    fn next_packet_id(&mut self) -> u64 {
        let id = *self.packet_ids;
        *self.packet_ids += 1;
        id
    }

    fn transmit(&mut self, link: LinkId, packet: Packet) {
        self.buffer.outgoing_packets.push((link, packet));
    }

    fn start_timer(&mut self, delay: SimTime, timer: TimerKind) {
        self.buffer.timer_ops.push(TimerOp::Start(delay, timer));
    }

    fn cancel_timer(&mut self, timer: TimerKind) {
        self.buffer.timer_ops.push(TimerOp::Cancel(timer));
    }

    fn request_route_rebuild(&mut self) {
        self.buffer.rebuild_routes = true;
    }

    fn log_event(&mut self, description: String) {
        self.buffer.events.push(description);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records everything a flow does, for driving flows without an engine.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingContext {
        pub(crate) now: SimTime,
        pub(crate) next_id: u64,
        pub(crate) sent: Vec<Packet>,
        pub(crate) timer_ops: Vec<TimerOp>,
        pub(crate) events: Vec<String>,
    }

    impl RecordingContext {
        pub(crate) fn take_sent(&mut self) -> Vec<Packet> {
            std::mem::take(&mut self.sent)
        }

        /// The delay of the most recent start of `timer`, unless it was
        /// cancelled afterwards.
        pub(crate) fn armed(&self, timer: TimerKind) -> Option<SimTime> {
            self.timer_ops.iter().rev().find_map(|op| match *op {
                TimerOp::Start(delay, t) if t == timer => Some(Some(delay)),
                TimerOp::Cancel(t) if t == timer => Some(None),
                _ => None,
            })?
        }
    }

    impl FlowContext for RecordingContext {
        fn now(&self) -> SimTime {
            self.now
        }

        fn next_packet_id(&mut self) -> u64 {
            self.next_id += 1;
            self.next_id
        }

        fn send(&mut self, packet: Packet) {
            self.sent.push(packet);
        }

        fn start_timer(&mut self, delay: SimTime, timer: TimerKind) {
            self.timer_ops.push(TimerOp::Start(delay, timer));
        }

        fn cancel_timer(&mut self, timer: TimerKind) {
            self.timer_ops.push(TimerOp::Cancel(timer));
        }

        fn log_event(&mut self, description: String) {
            self.events.push(description);
        }
    }
}
