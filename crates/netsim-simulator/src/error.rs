use netsim_abstract::{DeviceId, LinkId};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Rejected topology edits. None of these are fatal: the topology is left
/// unchanged and the caller may try again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("unknown link {0}")]
    UnknownLink(LinkId),
    #[error("cannot connect {0} to itself")]
    SelfLink(DeviceId),
    #[error("hosts {0} and {1} cannot be connected directly")]
    HostToHost(DeviceId, DeviceId),
    #[error("host {0} already has a gateway")]
    HostAlreadyHasGateway(DeviceId),
    #[error("{0} and {1} are already connected")]
    DuplicateLink(DeviceId, DeviceId),
    #[error("address {0} is already assigned")]
    AddressInUse(Ipv4Addr),
    #[error("invalid link parameters: {0}")]
    InvalidLinkParams(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    #[error("{0} is not a host")]
    UnknownHost(DeviceId),
    #[error("host {0} has no gateway")]
    NoGateway(DeviceId),
    #[error("invalid destination '{0}'")]
    InvalidDestination(String),
    #[error("data amount must be positive, got {0}")]
    NonPositiveData(i64),
    #[error("start delay must not be negative, got {0}")]
    NegativeDelay(f64),
}
