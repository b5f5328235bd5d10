/// Loop-aware hop-by-hop path tracer
///
/// Walks from the source toward the destination by repeatedly asking the device
/// currently holding the trace for its next hop. The walk is bounded both by a
/// per-address visit threshold (routing loops) and by a total hop budget.
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::zm_devices::DeviceRegistry;
use crate::zm_interface::{fmt_short, DeviceIndex, MeshStack, NwkAddress, RouteLookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Reached,
    Unreachable,
    LoopDetected,
    NodeNotFound,
    MaxHopsExceeded,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Reached => "REACHED",
            TraceStatus::Unreachable => "UNREACHABLE",
            TraceStatus::LoopDetected => "LOOP_DETECTED",
            TraceStatus::NodeNotFound => "NODE_NOT_FOUND",
            TraceStatus::MaxHopsExceeded => "MAX_HOPS_EXCEEDED",
        }
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub max_hops: usize,
    /// Number of times one address may hold the trace before it is declared a loop
    pub loop_threshold: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_hops: 30,
            loop_threshold: 3,
        }
    }
}

/// One step of the walk: `device` (at `address`) forwards to `next_hop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteHop {
    pub device: DeviceIndex,
    pub address: NwkAddress,
    pub next_hop: NwkAddress,
    pub neighbor: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceResult {
    pub source: NwkAddress,
    pub destination: NwkAddress,
    pub hops: Vec<RouteHop>,
    pub status: TraceStatus,
    /// Address holding the trace when it ended without reaching the destination
    pub stopped_at: Option<NwkAddress>,
}

impl TraceResult {
    pub fn reached(&self) -> bool {
        self.status == TraceStatus::Reached
    }

    /// Traceroute-style listing, one numbered line per hop.
    pub fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Traceroute to destination [{}]:", fmt_short(self.destination))?;
        for (i, hop) in self.hops.iter().enumerate() {
            write!(
                out,
                "{}. Node {} [{}]: NextHop [{}]",
                i + 1,
                hop.device,
                fmt_short(hop.address),
                fmt_short(hop.next_hop)
            )?;
            if hop.neighbor {
                write!(out, " (*Neighbor)")?;
            }
            writeln!(out)?;
        }
        match (self.status, self.stopped_at) {
            (TraceStatus::Reached, _) => writeln!(out, "Destination reached"),
            (status, Some(address)) => writeln!(out, "{} at [{}]", status, fmt_short(address)),
            (status, None) => writeln!(out, "{}", status),
        }
    }

    pub fn print_summary(&self) {
        let mut text = String::new();
        if self.render(&mut text).is_ok() {
            println!("\n{}", text);
        }
    }
}

/// What the tracer needs to know about the mesh.
pub trait RouteOracle {
    /// Device currently holding network address `address`.
    fn locate(&self, address: NwkAddress) -> Option<DeviceIndex>;

    /// Next hop from `device` toward `destination`.
    fn find_route(&self, device: DeviceIndex, destination: NwkAddress) -> RouteLookup;
}

/// Oracle backed by the live registry and network stack.
pub struct StackOracle<'a, S: MeshStack> {
    pub registry: &'a DeviceRegistry,
    pub stack: &'a S,
}

impl<'a, S: MeshStack> StackOracle<'a, S> {
    pub fn new(registry: &'a DeviceRegistry, stack: &'a S) -> Self {
        Self { registry, stack }
    }
}

impl<S: MeshStack> RouteOracle for StackOracle<'_, S> {
    fn locate(&self, address: NwkAddress) -> Option<DeviceIndex> {
        self.registry.by_network_address(address).map(|d| d.index)
    }

    fn find_route(&self, device: DeviceIndex, destination: NwkAddress) -> RouteLookup {
        self.stack.find_route(device, destination)
    }
}

/// Trace the path from `source` to `destination`.
pub fn trace_route<O: RouteOracle + ?Sized>(
    oracle: &O,
    source: NwkAddress,
    destination: NwkAddress,
    config: &TraceConfig,
) -> TraceResult {
    let mut hops = Vec::new();
    let mut visits: IndexMap<NwkAddress, u32> = IndexMap::new();
    let mut current = source;

    let finish = |hops: Vec<RouteHop>, status: TraceStatus, stopped_at: Option<NwkAddress>| {
        TraceResult {
            source,
            destination,
            hops,
            status,
            stopped_at,
        }
    };
    if source == destination {
        return finish(hops, TraceStatus::Reached, None);
    }

    loop {
        let count = visits.entry(current).or_insert(0);
        *count += 1;
        if *count >= config.loop_threshold {
            log::warn!(
                "trace to {}: loop detected at {}",
                fmt_short(destination),
                fmt_short(current)
            );
            return finish(hops, TraceStatus::LoopDetected, Some(current));
        }

        if hops.len() > config.max_hops {
            log::warn!(
                "trace to {}: exceeded {} hops",
                fmt_short(destination),
                config.max_hops
            );
            return finish(hops, TraceStatus::MaxHopsExceeded, Some(current));
        }

        let Some(device) = oracle.locate(current) else {
            log::warn!("trace: no device holds address {}", fmt_short(current));
            return finish(hops, TraceStatus::NodeNotFound, Some(current));
        };

        match oracle.find_route(device, destination) {
            RouteLookup::Unreachable => {
                return finish(hops, TraceStatus::Unreachable, Some(current));
            }
            RouteLookup::NextHop { address, neighbor } => {
                hops.push(RouteHop {
                    device,
                    address: current,
                    next_hop: address,
                    neighbor,
                });
                if address == destination {
                    return finish(hops, TraceStatus::Reached, None);
                }
                current = address;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const A: NwkAddress = 0x000A;
    const B: NwkAddress = 0x000B;
    const C: NwkAddress = 0x000C;
    const DEST: NwkAddress = 0x00DD;
    const Z: NwkAddress = 0x00FF;

    /// Synthetic mesh: address `n` lives on device `n`, routes from a fixed table.
    struct MapOracle {
        routes: HashMap<NwkAddress, (NwkAddress, bool)>,
        missing: Vec<NwkAddress>,
    }

    impl MapOracle {
        fn new(routes: &[(NwkAddress, NwkAddress, bool)]) -> Self {
            Self {
                routes: routes.iter().map(|&(from, to, n)| (from, (to, n))).collect(),
                missing: Vec::new(),
            }
        }
    }

    impl RouteOracle for MapOracle {
        fn locate(&self, address: NwkAddress) -> Option<DeviceIndex> {
            if self.missing.contains(&address) {
                None
            } else {
                Some(address as DeviceIndex)
            }
        }

        fn find_route(&self, device: DeviceIndex, _destination: NwkAddress) -> RouteLookup {
            match self.routes.get(&(device as NwkAddress)) {
                Some(&(next, neighbor)) => RouteLookup::from_raw(next, neighbor),
                None => RouteLookup::Unreachable,
            }
        }
    }

    #[test]
    fn test_trace_reaches_destination() {
        let oracle = MapOracle::new(&[(A, B, false), (B, C, true), (C, DEST, true)]);

        let result = trace_route(&oracle, A, DEST, &TraceConfig::default());

        assert_eq!(result.status, TraceStatus::Reached);
        let path: Vec<(NwkAddress, NwkAddress, bool)> = result
            .hops
            .iter()
            .map(|h| (h.address, h.next_hop, h.neighbor))
            .collect();
        assert_eq!(path, vec![(A, B, false), (B, C, true), (C, DEST, true)]);
        assert_eq!(result.stopped_at, None);
    }

    #[test]
    fn test_trace_detects_two_node_loop() {
        let oracle = MapOracle::new(&[(A, B, true), (B, A, true)]);

        let result = trace_route(&oracle, A, Z, &TraceConfig::default());

        assert_eq!(result.status, TraceStatus::LoopDetected);
        // A, B, A, B forwarded; the third visit of A stops the walk
        assert_eq!(result.hops.len(), 4);
        assert_eq!(result.stopped_at, Some(A));
    }

    #[test]
    fn test_loop_takes_precedence_over_hop_bound() {
        let oracle = MapOracle::new(&[(A, B, true), (B, A, true)]);
        let config = TraceConfig {
            max_hops: 3,
            loop_threshold: 3,
        };

        let result = trace_route(&oracle, A, Z, &config);

        assert_eq!(result.status, TraceStatus::LoopDetected);
    }

    #[test]
    fn test_trace_unreachable() {
        let oracle = MapOracle::new(&[(A, B, true)]);

        let result = trace_route(&oracle, A, DEST, &TraceConfig::default());

        assert_eq!(result.status, TraceStatus::Unreachable);
        assert_eq!(result.hops.len(), 1);
        assert_eq!(result.stopped_at, Some(B));
    }

    #[test]
    fn test_trace_node_not_found() {
        let mut oracle = MapOracle::new(&[(A, B, true), (B, DEST, true)]);
        oracle.missing.push(B);

        let result = trace_route(&oracle, A, DEST, &TraceConfig::default());

        assert_eq!(result.status, TraceStatus::NodeNotFound);
        assert_eq!(result.hops.len(), 1);
    }

    #[test]
    fn test_trace_hop_budget() {
        let routes: Vec<(NwkAddress, NwkAddress, bool)> =
            (1..60).map(|n| (n, n + 1, true)).collect();
        let oracle = MapOracle::new(&routes);
        let config = TraceConfig {
            max_hops: 5,
            loop_threshold: 3,
        };

        let result = trace_route(&oracle, 1, 0x0100, &config);

        assert_eq!(result.status, TraceStatus::MaxHopsExceeded);
        assert_eq!(result.hops.len(), 6);
    }

    #[test]
    fn test_trace_to_self() {
        let oracle = MapOracle::new(&[]);
        let result = trace_route(&oracle, A, A, &TraceConfig::default());
        assert!(result.reached());
        assert!(result.hops.is_empty());
    }

    #[test]
    fn test_render_marks_neighbors() {
        let oracle = MapOracle::new(&[(A, B, false), (B, DEST, true)]);
        let result = trace_route(&oracle, A, DEST, &TraceConfig::default());

        let mut text = String::new();
        result.render(&mut text).unwrap();

        assert!(text.contains("1. Node 10 [00:0A]: NextHop [00:0B]\n"));
        assert!(text.contains("2. Node 11 [00:0B]: NextHop [00:DD] (*Neighbor)"));
        assert!(text.contains("Destination reached"));
    }
}
