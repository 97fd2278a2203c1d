use crate::config::SimConfigOverride;
use crate::flow::{CongestionAlgorithm, FlowStatus};
use crate::link::LinkParamsUpdate;
use serde::Deserialize;
use std::net::Ipv4Addr;

/// A topology plus a timeline of actions and the expected outcome,
/// loaded from TOML.
#[derive(Deserialize, Debug, Clone)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: SimConfigOverride,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub routers: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
    #[serde(default)]
    pub actions: Vec<ScenarioAction>,
    #[serde(default)]
    pub assertions: Vec<ScenarioAssertion>,
    /// Stop the simulation at this time instead of running until idle
    pub run_until_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LinkSpec {
    pub name: String,
    pub a: String,
    pub a_ip: Ipv4Addr,
    pub b: String,
    pub b_ip: Ipv4Addr,
    #[serde(default)]
    pub params: LinkParamsUpdate,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FlowSpec {
    pub name: String,
    /// Label of the sending host
    pub source: String,
    /// Destination address, `a.b.c.d` or `a.b.c.d/prefix`
    pub destination: String,
    pub data_bytes: i64,
    pub algorithm: CongestionAlgorithm,
    #[serde(default)]
    pub start_delay_secs: f64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioAction {
    /// Remove a link from the topology
    DetachLink { time_ms: u64, link: String },
    /// Change parameters of a link
    UpdateLink {
        time_ms: u64,
        link: String,
        params: LinkParamsUpdate,
    },
    /// Create a flow at a given time
    StartFlow { time_ms: u64, flow: FlowSpec },
}

impl ScenarioAction {
    pub fn time_ms(&self) -> u64 {
        match self {
            ScenarioAction::DetachLink { time_ms, .. }
            | ScenarioAction::UpdateLink { time_ms, .. }
            | ScenarioAction::StartFlow { time_ms, .. } => *time_ms,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioAssertion {
    /// The named flow reached `Complete`
    FlowComplete { flow: String },
    /// The named flow ended in the given status
    FlowStatus { flow: String, status: FlowStatus },
    /// The receiver of the named flow got exactly this many bytes in order
    DeliveredBytes { flow: String, bytes: u64 },
    /// The router forwards traffic for `destination` over the named link
    RouteVia {
        router: String,
        destination: Ipv4Addr,
        link: String,
    },
    /// The simulation finished within the given time
    MaxDuration { ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scenario_toml() {
        let scenario: Scenario = toml::from_str(
            r#"
            name = "dumbbell"
            hosts = ["h1", "h2"]
            routers = ["r1"]

            [config]
            seed = 7

            [[links]]
            name = "l1"
            a = "h1"
            a_ip = "10.0.0.1"
            b = "r1"
            b_ip = "10.0.0.254"
            params = { capacity_mbps = 10.0, loss_rate = 0.0 }

            [[flows]]
            name = "f1"
            source = "h1"
            destination = "10.0.1.1"
            data_bytes = 5000
            algorithm = "reno"

            [[actions]]
            type = "update_link"
            time_ms = 100
            link = "l1"
            params = { metric = 1 }

            [[assertions]]
            type = "flow_status"
            flow = "f1"
            status = "complete"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.hosts.len(), 2);
        assert_eq!(scenario.config.seed, Some(7));
        assert_eq!(scenario.links[0].params.loss_rate, Some(0.0));
        assert_eq!(scenario.flows[0].algorithm, CongestionAlgorithm::Reno);
        assert_eq!(scenario.actions[0].time_ms(), 100);
        assert!(matches!(
            scenario.assertions[0],
            ScenarioAssertion::FlowStatus {
                status: FlowStatus::Complete,
                ..
            }
        ));
    }
}
