use crate::id::{DeviceId, LinkId};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub const DEFAULT_CAPACITY_MBPS: f64 = 10.0;
pub const DEFAULT_DELAY_MS: f64 = 10.0;
pub const DEFAULT_LOSS_RATE: f64 = 0.1;
pub const DEFAULT_BUFFER_SIZE_KB: u32 = 64;
pub const DEFAULT_METRIC: u32 = 100;
pub const BYTES_PER_KB: u64 = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Host,
    Router,
}

/// Physical characteristics of a link, shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Bandwidth in Mbps
    pub capacity_mbps: f64,
    /// One-way propagation delay in milliseconds
    pub delay_ms: f64,
    /// Probability of losing a packet, in percent (0-100)
    pub loss_rate: f64,
    /// Per-direction buffer in KB (1 KB = 1024 bytes)
    pub buffer_size_kb: u32,
    /// Routing cost
    pub metric: u32,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            capacity_mbps: DEFAULT_CAPACITY_MBPS,
            delay_ms: DEFAULT_DELAY_MS,
            loss_rate: DEFAULT_LOSS_RATE,
            buffer_size_kb: DEFAULT_BUFFER_SIZE_KB,
            metric: DEFAULT_METRIC,
        }
    }
}

impl LinkParams {
    pub fn buffer_bytes(&self) -> u64 {
        self.buffer_size_kb as u64 * BYTES_PER_KB
    }
}

/// Partial update of [`LinkParams`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkParamsUpdate {
    pub capacity_mbps: Option<f64>,
    pub delay_ms: Option<f64>,
    pub loss_rate: Option<f64>,
    pub buffer_size_kb: Option<u32>,
    pub metric: Option<u32>,
}

impl LinkParamsUpdate {
    pub fn apply_to(&self, params: &mut LinkParams) {
        if let Some(v) = self.capacity_mbps {
            params.capacity_mbps = v;
        }
        if let Some(v) = self.delay_ms {
            params.delay_ms = v;
        }
        if let Some(v) = self.loss_rate {
            params.loss_rate = v.clamp(0.0, 100.0);
        }
        if let Some(v) = self.buffer_size_kb {
            params.buffer_size_kb = v;
        }
        if let Some(v) = self.metric {
            params.metric = v;
        }
    }
}

/// One side of a link as seen by the routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkEnd {
    pub device: DeviceId,
    pub kind: DeviceKind,
    pub ip: Ipv4Addr,
}

/// Link-state entry flooded between routers.
///
/// This is a value snapshot of a link: routers never hold references to
/// the live link. `version` increases whenever the metric changes, so a
/// newer advertisement replaces an older one during merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkState {
    pub id: LinkId,
    pub ends: [LinkEnd; 2],
    pub metric: u32,
    pub version: u64,
}

impl LinkState {
    pub fn other_end(&self, device: DeviceId) -> Option<&LinkEnd> {
        let [a, b] = &self.ends;
        if a.device == device {
            Some(b)
        } else if b.device == device {
            Some(a)
        } else {
            None
        }
    }

    pub fn end_of(&self, device: DeviceId) -> Option<&LinkEnd> {
        self.ends.iter().find(|end| end.device == device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_only_touches_given_fields() {
        let mut params = LinkParams::default();
        LinkParamsUpdate {
            metric: Some(1),
            loss_rate: Some(250.0),
            ..Default::default()
        }
        .apply_to(&mut params);

        assert_eq!(params.metric, 1);
        assert_eq!(params.loss_rate, 100.0);
        assert_eq!(params.capacity_mbps, DEFAULT_CAPACITY_MBPS);
        assert_eq!(params.buffer_bytes(), 65_536);
    }

    #[test]
    fn other_end_resolves_both_sides() {
        let a = LinkEnd {
            device: DeviceId(1),
            kind: DeviceKind::Host,
            ip: Ipv4Addr::new(10, 0, 0, 1),
        };
        let b = LinkEnd {
            device: DeviceId(2),
            kind: DeviceKind::Router,
            ip: Ipv4Addr::new(10, 0, 0, 254),
        };
        let state = LinkState {
            id: LinkId(7),
            ends: [a, b],
            metric: 5,
            version: 0,
        };

        assert_eq!(state.other_end(DeviceId(1)), Some(&b));
        assert_eq!(state.other_end(DeviceId(2)), Some(&a));
        assert_eq!(state.other_end(DeviceId(3)), None);
        assert_eq!(state.end_of(DeviceId(2)).map(|e| e.ip), Some(b.ip));
    }
}
