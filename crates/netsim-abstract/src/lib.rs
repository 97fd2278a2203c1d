pub mod config;
pub mod flow;
pub mod id;
pub mod link;
pub mod packet;
pub mod scenario;
pub mod time;

pub use config::{BufferPolicy, SimConfig, SimConfigOverride};
pub use flow::{CongestionAlgorithm, FlowStatus};
pub use id::{DeviceId, FlowId, LinkId};
pub use link::{DeviceKind, LinkEnd, LinkParams, LinkParamsUpdate, LinkState};
pub use packet::{Packet, PacketPayload, PacketType};
pub use scenario::{FlowSpec, LinkSpec, Scenario, ScenarioAction, ScenarioAssertion};
pub use time::SimTime;
