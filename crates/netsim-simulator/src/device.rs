use crate::context::{DeviceContext, TimerKind};
use crate::host::Host;
use crate::router::Router;
use netsim_abstract::{DeviceId, DeviceKind, LinkId, LinkState, Packet};
use std::net::Ipv4Addr;

/// A link as attached to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub port: u32,
    pub ip: Ipv4Addr,
    pub link: LinkId,
    /// Device at the far end of the link
    pub peer: DeviceId,
    pub peer_kind: DeviceKind,
}

/// Attached links of a device, in attach order.
///
/// Port numbers are handed out monotonically and never reused. The first
/// interface is the gateway and its address is the device address.
#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    list: Vec<Interface>,
    next_port: u32,
}

impl Interfaces {
    /// Adds the local side of `state` for `owner`. Returns `None` if the link
    /// does not touch `owner` or is already attached.
    pub fn attach(&mut self, owner: DeviceId, state: &LinkState) -> Option<Interface> {
        let local = state.end_of(owner)?;
        let peer = state.other_end(owner)?;
        if self.by_link(state.id).is_some() {
            return None;
        }

        let interface = Interface {
            port: self.next_port,
            ip: local.ip,
            link: state.id,
            peer: peer.device,
            peer_kind: peer.kind,
        };
        self.next_port += 1;
        self.list.push(interface);
        Some(interface)
    }

    pub fn detach(&mut self, link: LinkId) -> Option<Interface> {
        let index = self.list.iter().position(|i| i.link == link)?;
        Some(self.list.remove(index))
    }

    pub fn gateway(&self) -> Option<&Interface> {
        self.list.first()
    }

    pub fn by_link(&self, link: LinkId) -> Option<&Interface> {
        self.list.iter().find(|i| i.link == link)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

#[derive(Debug)]
pub enum Device {
    Host(Host),
    Router(Router),
}

impl Device {
    pub fn id(&self) -> DeviceId {
        match self {
            Device::Host(host) => host.id(),
            Device::Router(router) => router.id(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Device::Host(host) => host.label(),
            Device::Router(router) => router.label(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Host(_) => DeviceKind::Host,
            Device::Router(_) => DeviceKind::Router,
        }
    }

    pub fn interfaces(&self) -> &Interfaces {
        match self {
            Device::Host(host) => host.interfaces(),
            Device::Router(router) => router.interfaces(),
        }
    }

    /// Address of the gateway interface
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.interfaces().gateway().map(|i| i.ip)
    }

    pub fn as_host(&self) -> Option<&Host> {
        match self {
            Device::Host(host) => Some(host),
            Device::Router(_) => None,
        }
    }

    pub fn as_router(&self) -> Option<&Router> {
        match self {
            Device::Router(router) => Some(router),
            Device::Host(_) => None,
        }
    }

    pub fn attach_link(&mut self, ctx: &mut dyn DeviceContext, state: LinkState) {
        match self {
            Device::Host(host) => host.attach_link(state),
            Device::Router(router) => router.attach_link(ctx, state),
        }
    }

    pub fn detach_link(&mut self, ctx: &mut dyn DeviceContext, state: LinkState) {
        match self {
            Device::Host(host) => host.detach_link(state.id),
            Device::Router(router) => router.detach_link(ctx, state),
        }
    }

    pub fn receive(&mut self, ctx: &mut dyn DeviceContext, link: LinkId, packet: Packet) {
        match self {
            Device::Host(host) => host.receive(ctx, link, packet),
            Device::Router(router) => router.receive(ctx, link, packet),
        }
    }

    pub fn on_timer(&mut self, ctx: &mut dyn DeviceContext, timer: TimerKind) {
        match self {
            Device::Host(host) => host.on_timer(ctx, timer),
            // Routers arm no timers
            Device::Router(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_abstract::LinkEnd;

    fn state(id: u64, a: u64, b: u64) -> LinkState {
        LinkState {
            id: LinkId(id),
            ends: [
                LinkEnd {
                    device: DeviceId(a),
                    kind: DeviceKind::Router,
                    ip: Ipv4Addr::new(10, 0, id as u8, 1),
                },
                LinkEnd {
                    device: DeviceId(b),
                    kind: DeviceKind::Host,
                    ip: Ipv4Addr::new(10, 0, id as u8, 2),
                },
            ],
            metric: 100,
            version: 0,
        }
    }

    #[test]
    fn ports_are_monotonic_and_first_is_gateway() {
        let mut interfaces = Interfaces::default();
        let owner = DeviceId(1);

        let first = interfaces.attach(owner, &state(1, 1, 2)).unwrap();
        let second = interfaces.attach(owner, &state(2, 1, 3)).unwrap();
        assert_eq!((first.port, second.port), (0, 1));
        assert_eq!(second.peer_kind, DeviceKind::Host);
        assert!(interfaces.attach(owner, &state(2, 1, 3)).is_none());
        assert!(interfaces.attach(owner, &state(9, 4, 5)).is_none());

        assert_eq!(interfaces.gateway().map(|i| i.ip), Some(Ipv4Addr::new(10, 0, 1, 1)));
        interfaces.detach(LinkId(1));
        assert_eq!(interfaces.gateway().map(|i| i.link), Some(LinkId(2)));

        let third = interfaces.attach(owner, &state(3, 1, 6)).unwrap();
        assert_eq!(third.port, 2);
        assert_eq!(third.peer, DeviceId(6));
    }
}
