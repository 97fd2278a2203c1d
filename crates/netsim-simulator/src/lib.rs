pub mod congestion;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod flow;
pub mod flow_received;
pub mod host;
pub mod link;
pub mod router;
pub mod routing;
pub mod scenario_runner;
pub mod stats;
pub mod topology;
pub mod trace;

pub use engine::Simulator;
pub use error::{FlowError, TopologyError};
pub use topology::{FlowHandle, FlowRequest};
pub use trace::{EventSummary, SimulationReport};
