use crate::engine::Simulator;
use crate::topology::{FlowHandle, FlowRequest};
use crate::trace::SimulationReport;
use anyhow::{Context, anyhow, bail};
use netsim_abstract::time::{MICROS_PER_MS, as_millis_f64};
use netsim_abstract::{
    DeviceId, FlowSpec, FlowStatus, LinkId, LinkParams, Scenario, ScenarioAction,
    ScenarioAssertion, SimConfig,
};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    let scenario: Scenario = toml::from_str(&content).context("Failed to parse scenario")?;
    Ok(scenario)
}

pub fn run_scenario(path: &Path) -> anyhow::Result<SimulationReport> {
    let scenario = load_scenario(path)?;
    run(&scenario)
}

/// Scenario labels resolved to simulator ids.
#[derive(Default)]
struct Names {
    devices: HashMap<String, DeviceId>,
    links: HashMap<String, LinkId>,
    flows: HashMap<String, FlowHandle>,
}

impl Names {
    fn device(&self, label: &str) -> anyhow::Result<DeviceId> {
        self.devices
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("Unknown device '{label}'"))
    }

    fn link(&self, name: &str) -> anyhow::Result<LinkId> {
        self.links
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("Unknown link '{name}'"))
    }

    fn flow(&self, name: &str) -> anyhow::Result<FlowHandle> {
        self.flows
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("Unknown flow '{name}'"))
    }
}

/// Builds the scenario's network, plays its timeline and checks its
/// assertions. Returns the final report when every assertion holds.
pub fn run(scenario: &Scenario) -> anyhow::Result<SimulationReport> {
    info!("Running Scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        info!("Description: {}", scenario.description);
    }

    let mut config = SimConfig::default();
    scenario.config.apply_to(&mut config);
    let mut sim = Simulator::new(config);
    let mut names = Names::default();

    for label in &scenario.hosts {
        let id = sim.add_host(label.as_str());
        if names.devices.insert(label.clone(), id).is_some() {
            bail!("Duplicate device label '{label}'");
        }
    }
    for label in &scenario.routers {
        let id = sim.add_router(label.as_str());
        if names.devices.insert(label.clone(), id).is_some() {
            bail!("Duplicate device label '{label}'");
        }
    }

    for spec in &scenario.links {
        let mut params = LinkParams::default();
        spec.params.apply_to(&mut params);
        let id = sim
            .attach_link(
                names.device(&spec.a)?,
                spec.a_ip,
                names.device(&spec.b)?,
                spec.b_ip,
                params,
            )
            .with_context(|| format!("Failed to attach link '{}'", spec.name))?;
        names.links.insert(spec.name.clone(), id);
    }

    for spec in &scenario.flows {
        start_flow(&mut sim, &mut names, spec)?;
    }

    let mut actions: Vec<&ScenarioAction> = scenario.actions.iter().collect();
    actions.sort_by_key(|a| a.time_ms());
    for action in actions {
        // Nothing past the horizon happens
        if scenario.run_until_ms.is_some_and(|end| action.time_ms() > end) {
            break;
        }
        sim.run_until(action.time_ms() * MICROS_PER_MS);
        match action {
            ScenarioAction::DetachLink { link, .. } => {
                sim.detach_link(names.link(link)?)
                    .with_context(|| format!("Failed to detach link '{link}'"))?;
            }
            ScenarioAction::UpdateLink { link, params, .. } => {
                sim.update_link_parameters(names.link(link)?, params)
                    .with_context(|| format!("Failed to update link '{link}'"))?;
            }
            ScenarioAction::StartFlow { flow, .. } => {
                start_flow(&mut sim, &mut names, flow)?;
            }
        }
    }

    let max_duration = scenario.assertions.iter().find_map(|a| match a {
        ScenarioAssertion::MaxDuration { ms } => Some(*ms * MICROS_PER_MS),
        _ => None,
    });

    match scenario.run_until_ms {
        Some(ms) => sim.run_until(ms * MICROS_PER_MS),
        None => {
            while sim.step() {
                if max_duration.is_some_and(|limit| sim.current_time() > limit) {
                    bail!(
                        "Test timed out after {} ms",
                        as_millis_f64(sim.current_time())
                    );
                }
            }
        }
    }

    for assertion in &scenario.assertions {
        check(&sim, &names, assertion)?;
    }

    info!("Scenario '{}' passed", scenario.name);
    Ok(sim.export_report())
}

fn start_flow(sim: &mut Simulator, names: &mut Names, spec: &FlowSpec) -> anyhow::Result<()> {
    let handle = sim
        .create_flow(FlowRequest {
            source: names.device(&spec.source)?,
            destination: spec.destination.clone(),
            data_bytes: spec.data_bytes,
            algorithm: spec.algorithm,
            start_delay_secs: spec.start_delay_secs,
        })
        .with_context(|| format!("Failed to create flow '{}'", spec.name))?;
    if names.flows.insert(spec.name.clone(), handle).is_some() {
        bail!("Duplicate flow name '{}'", spec.name);
    }
    Ok(())
}

fn check(sim: &Simulator, names: &Names, assertion: &ScenarioAssertion) -> anyhow::Result<()> {
    match assertion {
        ScenarioAssertion::FlowComplete { flow } => {
            expect_status(sim, names, flow, FlowStatus::Complete)?;
        }
        ScenarioAssertion::FlowStatus { flow, status } => {
            expect_status(sim, names, flow, *status)?;
        }
        ScenarioAssertion::DeliveredBytes { flow, bytes } => {
            let handle = names.flow(flow)?;
            let delivered = sim
                .receiver_of(handle.flow)
                .map_or(0, |(_, rx)| rx.delivered_bytes());
            if delivered != *bytes {
                bail!(
                    "Assertion Failed: flow '{flow}' delivered {delivered} bytes, expected {bytes}"
                );
            }
        }
        ScenarioAssertion::RouteVia {
            router,
            destination,
            link,
        } => {
            let expected = names.link(link)?;
            let actual = sim
                .router_fib(names.device(router)?)
                .with_context(|| format!("'{router}' is not a router"))?
                .get(destination)
                .copied();
            if actual != Some(expected) {
                bail!(
                    "Assertion Failed: '{router}' routes {destination} via {actual:?}, expected {expected}"
                );
            }
        }
        ScenarioAssertion::MaxDuration { ms } => {
            let elapsed = as_millis_f64(sim.current_time());
            if elapsed > *ms as f64 {
                bail!("Assertion Failed: simulation ran {elapsed} ms, limit {ms} ms");
            }
        }
    }
    Ok(())
}

fn expect_status(
    sim: &Simulator,
    names: &Names,
    flow: &str,
    expected: FlowStatus,
) -> anyhow::Result<()> {
    let status = sim
        .flow(names.flow(flow)?)
        .map(|f| f.status())
        .with_context(|| format!("Flow '{flow}' disappeared"))?;
    if status != expected {
        bail!("Assertion Failed: flow '{flow}' is {status}, expected {expected}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const TWO_PATHS: &str = r#"
        name = "two paths"
        hosts = ["h1", "h2"]
        routers = ["r1", "r2", "r3"]

        [config]
        seed = 3

        [[links]]
        name = "h1-r1"
        a = "h1"
        a_ip = "10.0.0.1"
        b = "r1"
        b_ip = "10.0.0.254"
        params = { loss_rate = 0.0 }

        [[links]]
        name = "h2-r3"
        a = "h2"
        a_ip = "10.0.1.1"
        b = "r3"
        b_ip = "10.0.1.254"
        params = { loss_rate = 0.0 }

        [[links]]
        name = "direct"
        a = "r1"
        a_ip = "192.168.0.1"
        b = "r3"
        b_ip = "192.168.0.2"
        params = { loss_rate = 0.0, metric = 1 }

        [[links]]
        name = "r1-r2"
        a = "r1"
        a_ip = "192.168.1.1"
        b = "r2"
        b_ip = "192.168.1.2"
        params = { loss_rate = 0.0 }

        [[links]]
        name = "r2-r3"
        a = "r2"
        a_ip = "192.168.2.1"
        b = "r3"
        b_ip = "192.168.2.2"
        params = { loss_rate = 0.0 }

        [[flows]]
        name = "bulk"
        source = "h1"
        destination = "10.0.1.1"
        data_bytes = 500000
        algorithm = "reno"
        start_delay_secs = 1.0

        [[actions]]
        type = "update_link"
        time_ms = 1200
        link = "direct"
        params = { metric = 500 }

        [[assertions]]
        type = "flow_complete"
        flow = "bulk"

        [[assertions]]
        type = "delivered_bytes"
        flow = "bulk"
        bytes = 500000

        [[assertions]]
        type = "route_via"
        router = "r1"
        destination = "10.0.1.1"
        link = "r1-r2"

        [[assertions]]
        type = "max_duration"
        ms = 60000
    "#;

    fn parse(toml: &str) -> Scenario {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn runs_scenario_with_metric_change() {
        let report = run(&parse(TWO_PATHS)).unwrap();

        assert_eq!(report.flows.len(), 1);
        assert_eq!(report.flows[0].status, FlowStatus::Complete);
        assert_eq!(report.flows[0].delivered_bytes, Some(500_000));
        assert_eq!(report.links.len(), 5);
        assert_eq!(report.routers.len(), 3);
        let r1 = &report.routers[0];
        assert_eq!(r1.address, Some(Ipv4Addr::new(10, 0, 0, 254)));
        let to_h2 = r1
            .routes
            .iter()
            .find(|route| route.destination == Ipv4Addr::new(10, 0, 1, 1))
            .unwrap();
        assert_eq!(to_h2.cost, 300);
        assert!(report.events.iter().any(|e| e.description.contains("updated")));
    }

    #[test]
    fn failed_assertion_is_reported() {
        let scenario = parse(&TWO_PATHS.replace("\n        bytes = 500000", "\n        bytes = 1"));
        let err = run(&scenario).unwrap_err();
        assert!(err.to_string().contains("delivered 500000 bytes"), "{err}");
    }

    #[test]
    fn unknown_labels_are_errors() {
        let scenario = parse(&TWO_PATHS.replace(r#"b = "r2""#, r#"b = "r9""#));
        let err = run(&scenario).unwrap_err();
        assert!(err.to_string().contains("Unknown device 'r9'"), "{err}");
    }

    #[test]
    fn invalid_link_surfaces_topology_error() {
        let scenario = parse(&TWO_PATHS.replace(r#"a_ip = "10.0.1.1""#, r#"a_ip = "10.0.0.1""#));
        let err = run(&scenario).unwrap_err();
        assert!(format!("{err:#}").contains("h2-r3"), "{err:#}");
    }

    #[test]
    fn stops_at_run_until() {
        let mut scenario = parse(TWO_PATHS);
        scenario.run_until_ms = Some(500);
        scenario.assertions.clear();
        let report = run(&scenario).unwrap();
        assert_eq!(report.duration_ms, 500.0);
        assert_eq!(report.flows[0].status, FlowStatus::Waiting);
        assert!(!report.events.iter().any(|e| e.description.contains("updated")));
        assert_eq!(report.links[2].params.metric, 1);
    }

    #[test]
    fn bundled_scenarios_pass() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scenarios");
        for name in [
            "dumbbell_reno.toml",
            "link_failure.toml",
            "blackhole.toml",
            "shared_bottleneck.toml",
        ] {
            if let Err(err) = run_scenario(&dir.join(name)) {
                panic!("{name}: {err:#}");
            }
        }
    }

    #[test]
    fn loads_scenario_from_disk() {
        let path = std::env::temp_dir().join(format!("netsim-scenario-{}.toml", std::process::id()));
        fs::write(&path, TWO_PATHS).unwrap();
        let scenario = load_scenario(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(scenario.name, "two paths");

        assert!(load_scenario(Path::new("/nonexistent/netsim.toml")).is_err());
    }
}
