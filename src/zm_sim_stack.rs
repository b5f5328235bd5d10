// In-memory mesh network layer
//
// A deterministic stand-in for the real network-layer stack. Radio adjacency is an
// explicit link list; formation, discovery, association, tree/mesh routing and data
// delivery are modelled just far enough for the harness to run end to end.

use std::collections::VecDeque;
use std::fmt;

use indexmap::IndexMap;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::zm_interface::{
    fmt_extended, fmt_short, seconds, AppPayload, CapabilityInformation, DataRequestParams,
    DeviceIndex, DiscoveryParams, ExtAddress, FormationParams, JoinParams, MeshStack,
    NetworkDescriptor, NwkAddress, NwkStatus, PanId, RouteLookup, SimTime, StackEvent,
    StackOutput, TableKind, COORDINATOR_ADDRESS, UNASSIGNED_ADDRESS,
};

/// Superframe duration at 250 kbit/s (960 symbols of 16us)
const BASE_SUPERFRAME_US: SimTime = 15_360;

const STACK_PROFILE_PRO: u8 = 2;

/// First short address of the reserved broadcast range
const BROADCAST_RANGE_START: NwkAddress = 0xFFF8;

// ============================================================================
// Configuration
// ============================================================================

/// Radio and timing model of the simulated mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Pairs of device ordinals within radio range of each other
    pub links: Vec<(DeviceIndex, DeviceIndex)>,

    /// Base latency of one hop, seconds (default: 0.005)
    pub per_hop_delay_s: f64,

    /// Upper bound of the uniform extra latency per hop, seconds (default: 0.002)
    pub per_hop_jitter_s: f64,

    /// Probability that a single hop drops the frame (default: 0.0)
    pub loss_fraction: f64,

    /// Extra latency of the first packet toward a destination, seconds (default: 0.05)
    pub route_discovery_delay_s: f64,

    /// Association round trip, seconds (default: 0.1)
    pub join_delay_s: f64,

    /// Children a coordinator or router accepts (default: 20)
    pub max_children: usize,
}

impl NetworkConfig {
    /// Links of the ten device reference topology.
    pub fn ten_node_links() -> Vec<(DeviceIndex, DeviceIndex)> {
        vec![
            (0, 1),
            (0, 2),
            (0, 3),
            (0, 4),
            (0, 9),
            (1, 5),
            (1, 6),
            (1, 7),
            (2, 4),
            (3, 4),
            (3, 9),
            (4, 8),
            (4, 9),
            (5, 6),
            (5, 7),
            (6, 7),
            (8, 9),
        ]
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            links: Self::ten_node_links(),
            per_hop_delay_s: 0.005,
            per_hop_jitter_s: 0.002,
            loss_fraction: 0.0,
            route_discovery_delay_s: 0.05,
            join_delay_s: 0.1,
            max_children: 20,
        }
    }
}

// ============================================================================
// Per-device state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    extended_pan_id: ExtAddress,
    pan_id: PanId,
    channel: u8,
}

#[derive(Debug, Clone, Copy)]
struct RoutingEntry {
    next_hop: NwkAddress,
}

#[derive(Debug, Clone, Copy)]
struct RouteDiscoveryEntry {
    request_id: u8,
    source: NwkAddress,
    sender: NwkAddress,
    forward_cost: u8,
    residual_cost: u8,
    created_at: SimTime,
}

#[derive(Debug, Clone)]
struct SimNode {
    extended_address: ExtAddress,
    network_address: NwkAddress,
    /// Formed the network
    coordinator: bool,
    /// Joined with routing capability
    router_capable: bool,
    rx_on_when_idle: bool,
    /// Time from which the node relays and accepts children
    beaconing_since: Option<SimTime>,
    parent: Option<DeviceIndex>,
    depth: u8,
    children: usize,
    /// Beaconing neighbors seen by the last discovery
    candidates: Vec<DeviceIndex>,
    routing_table: IndexMap<NwkAddress, RoutingEntry>,
    route_discovery_table: IndexMap<NwkAddress, RouteDiscoveryEntry>,
}

impl SimNode {
    fn new(extended_address: ExtAddress) -> Self {
        Self {
            extended_address,
            network_address: UNASSIGNED_ADDRESS,
            coordinator: false,
            router_capable: false,
            rx_on_when_idle: false,
            beaconing_since: None,
            parent: None,
            depth: 0,
            children: 0,
            candidates: Vec::new(),
            routing_table: IndexMap::new(),
            route_discovery_table: IndexMap::new(),
        }
    }

    fn joined(&self) -> bool {
        self.network_address != UNASSIGNED_ADDRESS
    }

    fn beaconing_at(&self, now: SimTime) -> bool {
        self.beaconing_since.is_some_and(|since| since <= now)
    }

    fn device_type(&self) -> &'static str {
        if self.coordinator {
            "ZC"
        } else if self.router_capable {
            "ZR"
        } else {
            "ZED"
        }
    }
}

/// Channels 11..=26 selected by `mask`, lowest first.
fn channels(mask: u32) -> impl Iterator<Item = u8> {
    (11u8..=26).filter(move |ch| mask & (1u32 << ch) != 0)
}

fn scan_time(mask: u32, scan_duration: u8) -> SimTime {
    let per_channel = BASE_SUPERFRAME_US * ((1u64 << scan_duration.min(14)) + 1);
    channels(mask).count() as SimTime * per_channel
}

// ============================================================================
// Stack
// ============================================================================

/// Simulated network layer for every device of a run.
pub struct SimMeshStack {
    config: NetworkConfig,
    rng: StdRng,
    nodes: Vec<SimNode>,
    adjacency: Vec<Vec<DeviceIndex>>,
    network: Option<Network>,
    next_request_id: u8,
    frames_dropped: u64,
}

impl SimMeshStack {
    pub fn new(extended_addresses: &[ExtAddress], config: NetworkConfig, seed: u64) -> Self {
        let count = extended_addresses.len();
        let mut adjacency = vec![Vec::new(); count];
        for &(a, b) in &config.links {
            if a >= count || b >= count || a == b {
                warn!("ignoring link {}-{} outside the {} device mesh", a, b, count);
                continue;
            }
            if !adjacency[a].contains(&b) {
                adjacency[a].push(b);
                adjacency[b].push(a);
            }
        }
        for neighbors in adjacency.iter_mut() {
            neighbors.sort_unstable();
        }

        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            nodes: extended_addresses.iter().map(|&a| SimNode::new(a)).collect(),
            adjacency,
            network: None,
            next_request_id: 1,
            frames_dropped: 0,
        }
    }

    /// Frames lost to the radio model or to missing routes.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn device_by_address(&self, address: NwkAddress) -> Option<DeviceIndex> {
        if address == UNASSIGNED_ADDRESS {
            return None;
        }
        self.nodes.iter().position(|n| n.network_address == address)
    }

    fn allocate_address(&mut self) -> NwkAddress {
        loop {
            let candidate = self.rng.gen_range(0x0001..BROADCAST_RANGE_START);
            if self.device_by_address(candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Neighbors `device` can exchange frames with at `now`: mesh links between
    /// relaying nodes plus the parent/child links of the tree.
    fn routing_neighbors(&self, device: DeviceIndex, now: SimTime) -> Vec<DeviceIndex> {
        let node = &self.nodes[device];
        if !node.joined() {
            return Vec::new();
        }
        self.adjacency[device]
            .iter()
            .copied()
            .filter(|&other| {
                let peer = &self.nodes[other];
                if !peer.joined() {
                    return false;
                }
                let tree_link = node.parent == Some(other) || peer.parent == Some(device);
                let mesh_link = node.beaconing_at(now) && peer.beaconing_at(now);
                tree_link || mesh_link
            })
            .collect()
    }

    /// Shortest path from `from` to `to`, both ends included.
    fn shortest_path(
        &self,
        from: DeviceIndex,
        to: DeviceIndex,
        now: SimTime,
    ) -> Option<Vec<DeviceIndex>> {
        if from == to {
            return Some(vec![from]);
        }
        let mut previous: Vec<Option<DeviceIndex>> = vec![None; self.nodes.len()];
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::new();
        visited[from] = true;
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            for next in self.routing_neighbors(current, now) {
                if visited[next] {
                    continue;
                }
                visited[next] = true;
                previous[next] = Some(current);
                if next == to {
                    let mut path = vec![to];
                    let mut at = to;
                    while let Some(p) = previous[at] {
                        path.push(p);
                        at = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    fn install_route(&mut self, path: &[DeviceIndex], now: SimTime) {
        let Some(&last) = path.last() else {
            return;
        };
        let destination = self.nodes[last].network_address;
        let source = self.nodes[path[0]].network_address;
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        let hops = path.len() - 1;

        for (i, pair) in path.windows(2).enumerate() {
            let next_hop = self.nodes[pair[1]].network_address;
            let sender = if i == 0 {
                source
            } else {
                self.nodes[path[i - 1]].network_address
            };
            let node = &mut self.nodes[pair[0]];
            node.routing_table
                .insert(destination, RoutingEntry { next_hop });
            node.route_discovery_table.insert(
                destination,
                RouteDiscoveryEntry {
                    request_id,
                    source,
                    sender,
                    forward_cost: i as u8,
                    residual_cost: (hops - i) as u8,
                    created_at: now,
                },
            );
        }
    }

    fn per_hop_delay(&mut self) -> SimTime {
        let base = seconds(self.config.per_hop_delay_s);
        let jitter = seconds(self.config.per_hop_jitter_s);
        if jitter == 0 {
            base
        } else {
            base + self.rng.gen_range(0..=jitter)
        }
    }

    fn hop_lost(&mut self) -> bool {
        let p = self.config.loss_fraction.clamp(0.0, 1.0);
        p > 0.0 && self.rng.gen_bool(p)
    }

    fn write_neighbor_table(&self, device: DeviceIndex, out: &mut dyn fmt::Write) -> fmt::Result {
        let node = &self.nodes[device];
        writeln!(
            out,
            "{:<10} {:<26} {:<6} {:<10} {:<8} {}",
            "Address", "Extended Address", "Type", "RxOnIdle", "Relation", "Depth"
        )?;
        for &other in &self.adjacency[device] {
            let peer = &self.nodes[other];
            if !peer.joined() {
                continue;
            }
            let relation = if node.parent == Some(other) {
                "PARENT"
            } else if peer.parent == Some(device) {
                "CHILD"
            } else if node.router_capable || node.coordinator {
                if !(peer.router_capable || peer.coordinator) {
                    continue;
                }
                "SIBLING"
            } else {
                continue;
            };
            writeln!(
                out,
                "{:<10} {:<26} {:<6} {:<10} {:<8} {}",
                fmt_short(peer.network_address),
                fmt_extended(peer.extended_address),
                peer.device_type(),
                peer.rx_on_when_idle,
                relation,
                peer.depth
            )?;
        }
        Ok(())
    }

    fn write_routing_table(&self, device: DeviceIndex, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "{:<14} {:<8} {}", "Destination", "Status", "Next Hop")?;
        for (destination, entry) in &self.nodes[device].routing_table {
            writeln!(
                out,
                "{:<14} {:<8} {}",
                fmt_short(*destination),
                "ACTIVE",
                fmt_short(entry.next_hop)
            )?;
        }
        Ok(())
    }

    fn write_route_discovery_table(
        &self,
        device: DeviceIndex,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        writeln!(
            out,
            "{:<8} {:<10} {:<10} {:<10} {:<8} {:<8} {}",
            "ReqId", "Source", "Sender", "Dest", "FwdCost", "ResCost", "Created"
        )?;
        for (destination, entry) in &self.nodes[device].route_discovery_table {
            writeln!(
                out,
                "{:<8} {:<10} {:<10} {:<10} {:<8} {:<8} {}us",
                entry.request_id,
                fmt_short(entry.source),
                fmt_short(entry.sender),
                fmt_short(*destination),
                entry.forward_cost,
                entry.residual_cost,
                entry.created_at
            )?;
        }
        Ok(())
    }
}

impl MeshStack for SimMeshStack {
    fn formation_request(
        &mut self,
        device: DeviceIndex,
        params: &FormationParams,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    ) {
        let delay = scan_time(params.channel_mask, params.scan_duration);
        if device >= self.nodes.len() {
            warn!("formation request for unknown device {}", device);
            out.push(StackOutput {
                delay: 0,
                event: StackEvent::FormationConfirm {
                    device,
                    status: NwkStatus::InvalidRequest,
                },
            });
            return;
        }
        let status = match (self.network, channels(params.channel_mask).next()) {
            (Some(_), _) => NwkStatus::InvalidRequest,
            (None, None) => NwkStatus::StartupFailure,
            (None, Some(channel)) => {
                let pan_id = self.rng.gen_range(0x0001..0xFFFF);
                let node = &mut self.nodes[device];
                let network = Network {
                    extended_pan_id: node.extended_address,
                    pan_id,
                    channel,
                };
                node.network_address = COORDINATOR_ADDRESS;
                node.coordinator = true;
                node.rx_on_when_idle = true;
                node.beaconing_since = Some(now + delay);
                self.network = Some(network);
                info!(
                    "network {} formed on channel {}, PAN id {:#06X}",
                    fmt_extended(network.extended_pan_id),
                    channel,
                    pan_id
                );
                NwkStatus::Success
            }
        };
        out.push(StackOutput {
            delay,
            event: StackEvent::FormationConfirm { device, status },
        });
    }

    fn discovery_request(
        &mut self,
        device: DeviceIndex,
        params: &DiscoveryParams,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    ) {
        let delay = scan_time(params.channel_mask, params.scan_duration);
        if device >= self.nodes.len() {
            warn!("discovery request for unknown device {}", device);
            out.push(StackOutput {
                delay: 0,
                event: StackEvent::DiscoveryConfirm {
                    device,
                    status: NwkStatus::InvalidRequest,
                    networks: Vec::new(),
                },
            });
            return;
        }
        let mut networks = Vec::new();
        let mut candidates = Vec::new();

        if let Some(network) = self.network {
            let on_scanned_channel = channels(params.channel_mask).any(|c| c == network.channel);
            if on_scanned_channel {
                candidates = self.adjacency[device]
                    .iter()
                    .copied()
                    .filter(|&n| self.nodes[n].beaconing_at(now))
                    .collect();
            }
            if !candidates.is_empty() {
                networks.push(NetworkDescriptor {
                    extended_pan_id: network.extended_pan_id,
                    channel: network.channel,
                    pan_id: network.pan_id,
                    stack_profile: STACK_PROFILE_PRO,
                });
            }
        }

        let status = if networks.is_empty() {
            NwkStatus::NoNetworks
        } else {
            NwkStatus::Success
        };
        debug!("device {} heard {} beaconing neighbors", device, candidates.len());
        self.nodes[device].candidates = candidates;
        out.push(StackOutput {
            delay,
            event: StackEvent::DiscoveryConfirm {
                device,
                status,
                networks,
            },
        });
    }

    fn join_request(
        &mut self,
        device: DeviceIndex,
        params: &JoinParams,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    ) {
        let delay = seconds(self.config.join_delay_s);
        let confirm = |status: NwkStatus, network_address: NwkAddress| StackOutput {
            delay,
            event: StackEvent::JoinConfirm {
                device,
                status,
                network_address,
                extended_pan_id: params.extended_pan_id,
            },
        };

        let Some(joining) = self.nodes.get(device) else {
            warn!("join request for unknown device {}", device);
            out.push(confirm(NwkStatus::InvalidRequest, UNASSIGNED_ADDRESS));
            return;
        };
        let matches_network = self
            .network
            .is_some_and(|n| n.extended_pan_id == params.extended_pan_id);
        if joining.joined() {
            out.push(confirm(NwkStatus::InvalidRequest, UNASSIGNED_ADDRESS));
            return;
        }
        if !matches_network || joining.candidates.is_empty() {
            out.push(confirm(NwkStatus::NotPermitted, UNASSIGNED_ADDRESS));
            return;
        }

        let parent = joining
            .candidates
            .iter()
            .copied()
            .filter(|&c| {
                let node = &self.nodes[c];
                node.beaconing_at(now) && node.children < self.config.max_children
            })
            .min_by_key(|&c| (self.nodes[c].depth, c));

        let Some(parent) = parent else {
            warn!("device {}: no potential parent with free capacity", device);
            out.push(confirm(NwkStatus::NeighborTableFull, UNASSIGNED_ADDRESS));
            return;
        };

        let capability = CapabilityInformation::from_bits(params.capability);
        let address = self.allocate_address();
        let depth = self.nodes[parent].depth + 1;
        self.nodes[parent].children += 1;

        let node = &mut self.nodes[device];
        node.network_address = address;
        node.parent = Some(parent);
        node.depth = depth;
        node.router_capable = capability.router;
        node.rx_on_when_idle = capability.receiver_on_when_idle;
        debug!(
            "device {} associated to parent {} as {} (depth {})",
            device,
            parent,
            fmt_short(address),
            depth
        );
        out.push(confirm(NwkStatus::Success, address));
    }

    fn start_router_request(&mut self, device: DeviceIndex, now: SimTime) {
        let Some(node) = self.nodes.get_mut(device) else {
            return;
        };
        if !node.joined() || !node.router_capable {
            warn!("device {}: start router ignored, not a joined router", device);
            return;
        }
        node.beaconing_since = Some(now);
    }

    fn data_request(
        &mut self,
        device: DeviceIndex,
        params: &DataRequestParams,
        payload: AppPayload,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    ) {
        let Some(sender) = self.nodes.get(device) else {
            warn!("data request from unknown device {}, dropped", device);
            self.frames_dropped += 1;
            return;
        };
        if !sender.joined() {
            warn!("device {}: data request while not joined, dropped", device);
            self.frames_dropped += 1;
            return;
        }
        let route_discovery_delay = seconds(self.config.route_discovery_delay_s);

        let path = self
            .device_by_address(params.destination)
            .and_then(|dest| self.shortest_path(device, dest, now));
        let Some(path) = path else {
            debug!(
                "device {}: no route to {}",
                device,
                fmt_short(params.destination)
            );
            self.frames_dropped += 1;
            if params.discover_route {
                out.push(StackOutput {
                    delay: route_discovery_delay,
                    event: StackEvent::RouteDiscoveryConfirm {
                        device,
                        status: NwkStatus::RouteDiscoveryFailed,
                    },
                });
            }
            return;
        };

        let hops = path.len() - 1;
        let known = self.nodes[device]
            .routing_table
            .contains_key(&params.destination);
        let mut delay = 0;
        if !known && hops > 1 {
            if !params.discover_route {
                self.frames_dropped += 1;
                return;
            }
            self.install_route(&path, now);
            delay += route_discovery_delay;
            out.push(StackOutput {
                delay: route_discovery_delay,
                event: StackEvent::RouteDiscoveryConfirm {
                    device,
                    status: NwkStatus::Success,
                },
            });
        }

        for _ in 0..hops {
            if self.hop_lost() {
                self.frames_dropped += 1;
                return;
            }
            delay += self.per_hop_delay();
        }

        let destination = path[hops];
        out.push(StackOutput {
            delay,
            event: StackEvent::DataIndication {
                device: destination,
                source: self.nodes[device].network_address,
                payload,
            },
        });
    }

    fn find_route(&self, device: DeviceIndex, destination: NwkAddress) -> RouteLookup {
        let Some(dest) = self.device_by_address(destination) else {
            return RouteLookup::Unreachable;
        };
        if device >= self.nodes.len() {
            return RouteLookup::Unreachable;
        }
        // lookups see every router that has started, whenever it started
        match self.shortest_path(device, dest, SimTime::MAX) {
            Some(path) if path.len() > 1 => {
                let next = path[1];
                RouteLookup::from_raw(self.nodes[next].network_address, next == dest)
            }
            Some(_) => RouteLookup::NextHop {
                address: destination,
                neighbor: true,
            },
            None => RouteLookup::Unreachable,
        }
    }

    fn dump_table(
        &self,
        device: DeviceIndex,
        kind: TableKind,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        let Some(node) = self.nodes.get(device) else {
            return writeln!(out, "no such device {}", device);
        };
        writeln!(
            out,
            "[Node {} | {}] {}:",
            device,
            fmt_short(node.network_address),
            kind.as_str()
        )?;
        match kind {
            TableKind::Neighbor => self.write_neighbor_table(device, out),
            TableKind::Routing => self.write_routing_table(device, out),
            TableKind::RouteDiscovery => self.write_route_discovery_table(device, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zm_interface::{DeviceRole, JoiningMethod, ALL_CHANNELS, LOW_CHANNELS};

    const ROLES: [DeviceRole; 10] = [
        DeviceRole::Coordinator,
        DeviceRole::Router,
        DeviceRole::Router,
        DeviceRole::Router,
        DeviceRole::Router,
        DeviceRole::EndDevice,
        DeviceRole::EndDevice,
        DeviceRole::EndDevice,
        DeviceRole::EndDevice,
        DeviceRole::EndDevice,
    ];

    fn addresses() -> Vec<ExtAddress> {
        (0..10u64).map(|i| if i == 0 { 0xCAFE } else { i }).collect()
    }

    fn join(stack: &mut SimMeshStack, device: DeviceIndex, now: SimTime) -> StackEvent {
        let mut out = Vec::new();
        stack.discovery_request(device, &DiscoveryParams::default(), now, &mut out);
        let StackEvent::DiscoveryConfirm { networks, .. } = &out[0].event else {
            panic!("expected discovery confirm");
        };
        let extended_pan_id = networks.first().map(|n| n.extended_pan_id).unwrap_or(0);
        let params = JoinParams {
            extended_pan_id,
            capability: CapabilityInformation::for_role(ROLES[device]).to_bits(),
            rejoin_network: JoiningMethod::Association,
        };
        out.clear();
        stack.join_request(device, &params, now, &mut out);
        out.remove(0).event
    }

    /// Form and join the whole reference topology, one device per second.
    fn bring_up(config: NetworkConfig) -> SimMeshStack {
        let mut stack = SimMeshStack::new(&addresses(), config, 3);
        let mut out = Vec::new();
        stack.formation_request(0, &FormationParams::default(), seconds(1.0), &mut out);
        for device in 1..10 {
            let now = seconds(2.0 + device as f64);
            let event = join(&mut stack, device, now);
            if ROLES[device] == DeviceRole::Router {
                if let StackEvent::JoinConfirm { status, .. } = event {
                    if status.is_success() {
                        stack.start_router_request(device, now + seconds(0.2));
                    }
                }
            }
        }
        stack
    }

    fn address_of(stack: &SimMeshStack, device: DeviceIndex) -> NwkAddress {
        stack.nodes[device].network_address
    }

    #[test]
    fn test_formation_picks_lowest_channel() {
        let mut stack = SimMeshStack::new(&addresses(), NetworkConfig::default(), 1);
        let mut out = Vec::new();

        stack.formation_request(0, &FormationParams::default(), 0, &mut out);

        assert_eq!(
            out[0].event,
            StackEvent::FormationConfirm {
                device: 0,
                status: NwkStatus::Success
            }
        );
        assert_eq!(out[0].delay, scan_time(ALL_CHANNELS, 0));
        assert_eq!(stack.network.map(|n| n.channel), Some(11));
        assert_eq!(address_of(&stack, 0), COORDINATOR_ADDRESS);
    }

    #[test]
    fn test_formation_with_empty_channel_mask_fails() {
        let mut stack = SimMeshStack::new(&addresses(), NetworkConfig::default(), 1);
        let mut out = Vec::new();
        let params = FormationParams {
            channel_mask: 0,
            ..Default::default()
        };

        stack.formation_request(0, &params, 0, &mut out);

        assert_eq!(
            out[0].event,
            StackEvent::FormationConfirm {
                device: 0,
                status: NwkStatus::StartupFailure
            }
        );
        assert!(stack.network.is_none());
    }

    #[test]
    fn test_discovery_before_formation_finds_nothing() {
        let mut stack = SimMeshStack::new(&addresses(), NetworkConfig::default(), 1);
        let mut out = Vec::new();

        stack.discovery_request(1, &DiscoveryParams::default(), 0, &mut out);

        assert_eq!(
            out[0].event,
            StackEvent::DiscoveryConfirm {
                device: 1,
                status: NwkStatus::NoNetworks,
                networks: Vec::new()
            }
        );
        assert_eq!(out[0].delay, scan_time(LOW_CHANNELS, 2));
    }

    #[test]
    fn test_discovery_reports_coordinator_network() {
        let mut stack = SimMeshStack::new(&addresses(), NetworkConfig::default(), 1);
        let mut out = Vec::new();
        stack.formation_request(0, &FormationParams::default(), seconds(1.0), &mut out);
        out.clear();

        stack.discovery_request(1, &DiscoveryParams::default(), seconds(3.0), &mut out);

        let StackEvent::DiscoveryConfirm {
            status, networks, ..
        } = &out[0].event
        else {
            panic!("expected discovery confirm");
        };
        assert_eq!(*status, NwkStatus::Success);
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].extended_pan_id, 0xCAFE);
        assert_eq!(networks[0].channel, 11);
    }

    #[test]
    fn test_full_bring_up_assigns_unique_addresses() {
        let stack = bring_up(NetworkConfig::default());

        let mut seen = std::collections::HashSet::new();
        for device in 0..10 {
            let address = address_of(&stack, device);
            assert_ne!(address, UNASSIGNED_ADDRESS, "device {} not joined", device);
            assert!(seen.insert(address));
        }
        assert_eq!(stack.nodes[5].parent, Some(1));
        assert_eq!(stack.nodes[8].parent, Some(4));
        assert_eq!(stack.nodes[4].parent, Some(0));
    }

    #[test]
    fn test_routes_follow_mesh_and_tree() {
        let stack = bring_up(NetworkConfig::default());
        let dest = address_of(&stack, 6);

        assert_eq!(
            stack.find_route(4, dest),
            RouteLookup::NextHop {
                address: COORDINATOR_ADDRESS,
                neighbor: false
            }
        );
        assert_eq!(
            stack.find_route(0, dest),
            RouteLookup::NextHop {
                address: address_of(&stack, 1),
                neighbor: false
            }
        );
        assert_eq!(
            stack.find_route(1, dest),
            RouteLookup::NextHop {
                address: dest,
                neighbor: true
            }
        );
        assert_eq!(stack.find_route(1, 0x0BAD), RouteLookup::Unreachable);
    }

    #[test]
    fn test_capacity_limit_rejects_join() {
        let config = NetworkConfig {
            max_children: 2,
            ..Default::default()
        };
        let mut stack = SimMeshStack::new(&addresses(), config, 3);
        let mut out = Vec::new();
        stack.formation_request(0, &FormationParams::default(), seconds(1.0), &mut out);

        let first = join(&mut stack, 1, seconds(3.0));
        let second = join(&mut stack, 2, seconds(4.0));
        let third = join(&mut stack, 3, seconds(5.0));

        assert!(matches!(
            first,
            StackEvent::JoinConfirm {
                status: NwkStatus::Success,
                ..
            }
        ));
        assert!(matches!(
            second,
            StackEvent::JoinConfirm {
                status: NwkStatus::Success,
                ..
            }
        ));
        assert!(matches!(
            third,
            StackEvent::JoinConfirm {
                status: NwkStatus::NeighborTableFull,
                network_address: UNASSIGNED_ADDRESS,
                ..
            }
        ));
    }

    #[test]
    fn test_data_delivery_with_first_use_route_discovery() {
        let mut stack = bring_up(NetworkConfig::default());
        let params = DataRequestParams {
            destination: address_of(&stack, 6),
            handle: 1,
            discover_route: true,
        };
        let now = seconds(20.0);
        let mut out = Vec::new();

        stack.data_request(4, &params, AppPayload::zeroed(5), now, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].event,
            StackEvent::RouteDiscoveryConfirm {
                device: 4,
                status: NwkStatus::Success
            }
        );
        let StackEvent::DataIndication { device, source, .. } = &out[1].event else {
            panic!("expected data indication");
        };
        assert_eq!(*device, 6);
        assert_eq!(*source, address_of(&stack, 4));
        // discovery latency plus three hops
        let min = seconds(0.05) + 3 * seconds(0.005);
        let max = min + 3 * seconds(0.002);
        assert!(out[1].delay >= min && out[1].delay <= max);

        // the route is cached afterwards
        out.clear();
        stack.data_request(4, &params, AppPayload::zeroed(5), now, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].delay < seconds(0.05));

        let mut table = String::new();
        stack.dump_table(4, TableKind::Routing, &mut table).unwrap();
        assert!(table.contains(&fmt_short(params.destination)));
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let config = NetworkConfig {
            loss_fraction: 1.0,
            ..Default::default()
        };
        let mut stack = bring_up(config);
        let params = DataRequestParams {
            destination: address_of(&stack, 0),
            handle: 1,
            discover_route: true,
        };
        let mut out = Vec::new();

        stack.data_request(1, &params, AppPayload::zeroed(5), seconds(20.0), &mut out);

        assert!(out.is_empty());
        assert_eq!(stack.frames_dropped(), 1);
    }

    #[test]
    fn test_data_to_unassigned_address_fails_route_discovery() {
        let mut stack = bring_up(NetworkConfig::default());
        let params = DataRequestParams {
            destination: UNASSIGNED_ADDRESS,
            handle: 1,
            discover_route: true,
        };
        let mut out = Vec::new();

        stack.data_request(4, &params, AppPayload::zeroed(5), seconds(20.0), &mut out);

        assert_eq!(
            out,
            vec![StackOutput {
                delay: seconds(0.05),
                event: StackEvent::RouteDiscoveryConfirm {
                    device: 4,
                    status: NwkStatus::RouteDiscoveryFailed
                }
            }]
        );
    }

    #[test]
    fn test_unknown_device_is_refused_not_indexed() {
        let mut stack = bring_up(NetworkConfig::default());
        let mut out = Vec::new();

        stack.formation_request(42, &FormationParams::default(), seconds(30.0), &mut out);
        stack.discovery_request(42, &DiscoveryParams::default(), seconds(30.0), &mut out);
        let params = JoinParams {
            extended_pan_id: 0xCAFE,
            capability: 0x80,
            rejoin_network: JoiningMethod::Association,
        };
        stack.join_request(42, &params, seconds(30.0), &mut out);

        let statuses: Vec<NwkStatus> = out
            .iter()
            .map(|o| match &o.event {
                StackEvent::FormationConfirm { device, status }
                | StackEvent::DiscoveryConfirm { device, status, .. }
                | StackEvent::JoinConfirm { device, status, .. } => {
                    assert_eq!(*device, 42);
                    *status
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(statuses, vec![NwkStatus::InvalidRequest; 3]);

        out.clear();
        let data = DataRequestParams {
            destination: address_of(&stack, 0),
            handle: 1,
            discover_route: true,
        };
        stack.data_request(42, &data, AppPayload::zeroed(5), seconds(30.0), &mut out);
        assert!(out.is_empty());
        assert_eq!(stack.frames_dropped(), 1);

        stack.start_router_request(42, seconds(30.0));
        assert_eq!(stack.find_route(42, address_of(&stack, 0)), RouteLookup::Unreachable);
    }

    #[test]
    fn test_neighbor_table_dump() {
        let stack = bring_up(NetworkConfig::default());
        let mut table = String::new();

        stack.dump_table(1, TableKind::Neighbor, &mut table).unwrap();

        assert!(table.starts_with("[Node 1 | "));
        assert!(table.contains("Neighbor Table"));
        assert!(table.contains("PARENT"));
        assert!(table.contains("CHILD"));
        assert!(table.contains("00:00:00:00:00:00:CA:FE"));
    }
}
