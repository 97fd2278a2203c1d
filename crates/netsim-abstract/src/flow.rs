use serde::{Deserialize, Serialize};
use std::fmt;

/// Congestion control strategy used by a sender flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionAlgorithm {
    Tahoe,
    Reno,
    Vegas,
    Fast,
}

/// Sender-side transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Counting down the start delay
    Waiting,
    /// SYN sent, waiting for SynAck
    HandShake,
    SlowStart,
    CongestionAvoidance,
    /// Fast retransmit / fast recovery
    FastRecovery,
    Complete,
}

impl FlowStatus {
    pub fn is_transferring(self) -> bool {
        matches!(
            self,
            FlowStatus::SlowStart | FlowStatus::CongestionAvoidance | FlowStatus::FastRecovery
        )
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowStatus::Waiting => "Waiting",
            FlowStatus::HandShake => "HandShake",
            FlowStatus::SlowStart => "SS",
            FlowStatus::CongestionAvoidance => "CA",
            FlowStatus::FastRecovery => "FRFR",
            FlowStatus::Complete => "Complete",
        };
        f.write_str(name)
    }
}
