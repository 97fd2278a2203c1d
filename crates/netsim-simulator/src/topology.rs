use crate::device::Device;
use crate::engine::Simulator;
use crate::error::{FlowError, TopologyError};
use crate::flow::Flow;
use crate::flow_received::FlowReceived;
use crate::host::Host;
use crate::link::Link;
use crate::router::Router;
use crate::routing::Lsdb;
use netsim_abstract::packet::BROADCAST_IP;
use netsim_abstract::time::{MICROS_PER_MS, from_secs_f64};
use netsim_abstract::{
    CongestionAlgorithm, DeviceId, DeviceKind, FlowId, LinkEnd, LinkId, LinkParams,
    LinkParamsUpdate,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::info;

/// Parameters of a new flow, as supplied by the caller.
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub source: DeviceId,
    /// `a.b.c.d` or `a.b.c.d/prefix`
    pub destination: String,
    pub data_bytes: i64,
    pub algorithm: CongestionAlgorithm,
    pub start_delay_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle {
    pub host: DeviceId,
    pub flow: FlowId,
}

/// Parses a destination given as an address or CIDR block.
pub fn parse_destination(destination: &str) -> Result<Ipv4Addr, FlowError> {
    let invalid = || FlowError::InvalidDestination(destination.to_string());
    let (address, prefix) = match destination.trim().split_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (destination.trim(), None),
    };
    if let Some(prefix) = prefix {
        match prefix.parse::<u8>() {
            Ok(bits) if bits <= 32 => {}
            _ => return Err(invalid()),
        }
    }
    let ip: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    if ip == BROADCAST_IP {
        return Err(invalid());
    }
    Ok(ip)
}

/// Rejects parameters that would make a link unusable or stall the clock.
pub fn validate_link_params(params: &LinkParams) -> Result<(), TopologyError> {
    let invalid = |reason: String| Err(TopologyError::InvalidLinkParams(reason));
    if !params.capacity_mbps.is_finite() || params.capacity_mbps <= 0.0 {
        return invalid(format!("capacity must be positive, got {}", params.capacity_mbps));
    }
    if !params.delay_ms.is_finite() || params.delay_ms < 0.0 {
        return invalid(format!("delay must not be negative, got {}", params.delay_ms));
    }
    if !(0.0..=100.0).contains(&params.loss_rate) {
        return invalid(format!("loss rate must be within 0-100%, got {}", params.loss_rate));
    }
    Ok(())
}

impl Simulator {
    pub fn add_host(&mut self, label: impl Into<String>) -> DeviceId {
        let id = self.next_device_id();
        let host = Host::new(id, label);
        info!(device = %id, label = host.label(), "host added");
        self.devices.insert(id, Device::Host(host));
        id
    }

    pub fn add_router(&mut self, label: impl Into<String>) -> DeviceId {
        let id = self.next_device_id();
        let ttl = self.config.broadcast_cache_ttl_ms * MICROS_PER_MS;
        let router = Router::new(id, label, ttl);
        info!(device = %id, label = router.label(), "router added");
        self.devices.insert(id, Device::Router(router));
        id
    }

    fn next_device_id(&mut self) -> DeviceId {
        self.device_id_counter += 1;
        DeviceId(self.device_id_counter)
    }

    /// Detaches every link of the device, then removes it. Pending events
    /// addressed to it are discarded when they come up.
    pub fn remove_device(&mut self, id: DeviceId) -> Result<(), TopologyError> {
        let links: Vec<LinkId> = self
            .devices
            .get(&id)
            .ok_or(TopologyError::UnknownDevice(id))?
            .interfaces()
            .iter()
            .map(|i| i.link)
            .collect();
        for link in links {
            self.detach_link(link)?;
        }

        if let Some(device) = self.devices.remove(&id) {
            self.record_event(format!("{} removed", device.label()));
        }
        self.forget_timers(id);
        Ok(())
    }

    pub fn attach_link(
        &mut self,
        a: DeviceId,
        ip_a: Ipv4Addr,
        b: DeviceId,
        ip_b: Ipv4Addr,
        params: LinkParams,
    ) -> Result<LinkId, TopologyError> {
        if a == b {
            return Err(TopologyError::SelfLink(a));
        }
        validate_link_params(&params)?;
        let device_a = self.devices.get(&a).ok_or(TopologyError::UnknownDevice(a))?;
        let device_b = self.devices.get(&b).ok_or(TopologyError::UnknownDevice(b))?;
        let (kind_a, kind_b) = (device_a.kind(), device_b.kind());

        if kind_a == DeviceKind::Host && kind_b == DeviceKind::Host {
            return Err(TopologyError::HostToHost(a, b));
        }
        for device in [device_a, device_b] {
            if device.kind() == DeviceKind::Host && !device.interfaces().is_empty() {
                return Err(TopologyError::HostAlreadyHasGateway(device.id()));
            }
        }
        if self.links.values().any(|link| link.connects(a, b)) {
            return Err(TopologyError::DuplicateLink(a, b));
        }
        if ip_a == ip_b || self.address_in_use(ip_a) {
            return Err(TopologyError::AddressInUse(ip_a));
        }
        if self.address_in_use(ip_b) {
            return Err(TopologyError::AddressInUse(ip_b));
        }

        self.link_id_counter += 1;
        let id = LinkId(self.link_id_counter);
        let ends = [
            LinkEnd {
                device: a,
                kind: kind_a,
                ip: ip_a,
            },
            LinkEnd {
                device: b,
                kind: kind_b,
                ip: ip_b,
            },
        ];
        let link = Link::new(id, ends, params, self.config.stats_retention);
        let state = link.state();
        self.links.insert(id, link);

        for end in [a, b] {
            self.with_device(end, |device, ctx| device.attach_link(ctx, state));
        }

        let description = format!(
            "{id} attached: {} ({ip_a}) <-> {} ({ip_b})",
            self.label_of(a),
            self.label_of(b)
        );
        info!("{description}");
        self.record_event(description);
        Ok(id)
    }

    /// Removes a link. Packets queued on or travelling over it are lost.
    pub fn detach_link(&mut self, id: LinkId) -> Result<(), TopologyError> {
        let link = self.links.remove(&id).ok_or(TopologyError::UnknownLink(id))?;
        let state = link.state();
        for end in link.ends() {
            self.with_device(end.device, |device, ctx| device.detach_link(ctx, state));
        }

        let description = format!("{id} detached");
        info!("{description}");
        self.record_event(description);
        Ok(())
    }

    pub fn update_link_parameters(
        &mut self,
        id: LinkId,
        update: &LinkParamsUpdate,
    ) -> Result<(), TopologyError> {
        let link = self.links.get_mut(&id).ok_or(TopologyError::UnknownLink(id))?;
        let mut candidate = link.params().clone();
        update.apply_to(&mut candidate);
        validate_link_params(&candidate)?;
        let metric_changed = link.update_params(update);
        let state = link.state();
        let params = link.params().clone();

        if metric_changed {
            for end in state.ends {
                self.with_device(end.device, |device, ctx| {
                    if let Device::Router(router) = device {
                        router.advertise_link_state(ctx, state);
                    }
                });
            }
        }

        self.record_event(format!(
            "{id} updated: {} Mbps, {} ms, {}% loss, {} KB, metric {}",
            params.capacity_mbps,
            params.delay_ms,
            params.loss_rate,
            params.buffer_size_kb,
            params.metric
        ));
        Ok(())
    }

    pub fn create_flow(&mut self, request: FlowRequest) -> Result<FlowHandle, FlowError> {
        if request.data_bytes <= 0 {
            return Err(FlowError::NonPositiveData(request.data_bytes));
        }
        if !request.start_delay_secs.is_finite() || request.start_delay_secs < 0.0 {
            return Err(FlowError::NegativeDelay(request.start_delay_secs));
        }
        let destination = parse_destination(&request.destination)?;

        let host = match self.devices.get(&request.source) {
            Some(Device::Host(host)) => host,
            _ => return Err(FlowError::UnknownHost(request.source)),
        };
        let source_ip = host.ip().ok_or(FlowError::NoGateway(request.source))?;
        if destination == source_ip {
            return Err(FlowError::InvalidDestination(request.destination));
        }

        let id = FlowId(self.flow_id_counter);
        self.flow_id_counter += 1;
        let flow = Flow::new(
            id,
            source_ip,
            destination,
            request.algorithm,
            request.data_bytes as u64,
            from_secs_f64(request.start_delay_secs),
            &self.config,
        );

        let description = format!(
            "{id} created: {} -> {destination}, {} bytes, {:?}",
            self.label_of(request.source),
            request.data_bytes,
            request.algorithm
        );
        info!("{description}");
        self.record_event(description);

        self.with_device(request.source, |device, ctx| {
            if let Device::Host(host) = device {
                host.start_flow(ctx, flow);
            }
        });
        Ok(FlowHandle {
            host: request.source,
            flow: id,
        })
    }

    fn address_in_use(&self, ip: Ipv4Addr) -> bool {
        self.devices
            .values()
            .any(|d| d.interfaces().iter().any(|i| i.ip == ip))
    }

    pub(crate) fn label_of(&self, id: DeviceId) -> String {
        self.devices
            .get(&id)
            .map(|d| d.label().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn flow(&self, handle: FlowHandle) -> Option<&Flow> {
        self.devices.get(&handle.host)?.as_host()?.flow(handle.flow)
    }

    pub fn flow_received(&self, host: DeviceId, flow: FlowId) -> Option<&FlowReceived> {
        self.devices.get(&host)?.as_host()?.flow_received(flow)
    }

    /// Finds the host receiving `flow`.
    pub fn receiver_of(&self, flow: FlowId) -> Option<(DeviceId, &FlowReceived)> {
        self.devices.values().find_map(|device| {
            let host = device.as_host()?;
            host.flow_received(flow).map(|rx| (host.id(), rx))
        })
    }

    pub fn router_fib(&self, id: DeviceId) -> Option<&BTreeMap<Ipv4Addr, LinkId>> {
        Some(self.devices.get(&id)?.as_router()?.fib())
    }

    pub fn router_lsdb(&self, id: DeviceId) -> Option<&Lsdb> {
        Some(self.devices.get(&id)?.as_router()?.lsdb())
    }
}
