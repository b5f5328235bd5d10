// Shared types for the mesh harness: addressing, the network-layer collaborator
// contract, the confirmation/indication events it emits and the harness event log.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::zm_trace::TraceStatus;

// ordinal of a device in the registry
pub type DeviceIndex = usize;

// 16-bit network (short) address, assigned on join
pub type NwkAddress = u16;

// 64-bit IEEE extended address, fixed for the device
pub type ExtAddress = u64;

pub type PanId = u16;
pub type PacketId = u32;

/// Virtual time in microseconds since the start of the run.
pub type SimTime = u64;

pub const MICROS_PER_SECOND: SimTime = 1_000_000;

/// Network address of a device that has not (yet) joined.
pub const UNASSIGNED_ADDRESS: NwkAddress = 0xFFFF;

/// Route lookup sentinel returned by the stack when no next hop exists.
pub const UNREACHABLE_ADDRESS: NwkAddress = 0xFFFF;

/// The coordinator always takes short address 0x0000 when it forms the network.
pub const COORDINATOR_ADDRESS: NwkAddress = 0x0000;

/// Channels 11..=26 on page 0.
pub const ALL_CHANNELS: u32 = 0x07FF_F800;

/// Channels 11..=14.
pub const LOW_CHANNELS: u32 = 0x0000_7800;

/// Serialized size of the packet id tag carried by application payloads.
pub const PACKET_TAG_SIZE: usize = 4;

/// Convert seconds (as configured) into virtual time. Negative input clamps to zero.
pub fn seconds(s: f64) -> SimTime {
    if s <= 0.0 {
        return 0;
    }
    (s * MICROS_PER_SECOND as f64).round() as SimTime
}

pub fn as_seconds(t: SimTime) -> f64 {
    t as f64 / MICROS_PER_SECOND as f64
}

/// `CA:FE` style rendering of a short address.
pub fn fmt_short(address: NwkAddress) -> String {
    let [hi, lo] = address.to_be_bytes();
    format!("{:02X}:{:02X}", hi, lo)
}

/// `00:00:00:00:00:00:CA:FE` style rendering of an extended address.
pub fn fmt_extended(address: ExtAddress) -> String {
    address
        .to_be_bytes()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

// ============================================================================
// Roles and status codes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    Coordinator,
    Router,
    EndDevice,
}

impl DeviceRole {
    /// Coordinator and routers relay traffic; end devices only talk to their parent.
    pub fn routes(&self) -> bool {
        !matches!(self, DeviceRole::EndDevice)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Coordinator => "ZC",
            DeviceRole::Router => "ZR",
            DeviceRole::EndDevice => "ZED",
        }
    }
}

/// Status codes carried by confirmations from the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NwkStatus {
    Success,
    InvalidParameter,
    InvalidRequest,
    NotPermitted,
    StartupFailure,
    NoNetworks,
    NeighborTableFull,
    RouteDiscoveryFailed,
    RouteError,
}

impl NwkStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, NwkStatus::Success)
    }
}

impl fmt::Display for NwkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NwkStatus::Success => "SUCCESS",
            NwkStatus::InvalidParameter => "INVALID_PARAMETER",
            NwkStatus::InvalidRequest => "INVALID_REQUEST",
            NwkStatus::NotPermitted => "NOT_PERMITTED",
            NwkStatus::StartupFailure => "STARTUP_FAILURE",
            NwkStatus::NoNetworks => "NO_NETWORKS",
            NwkStatus::NeighborTableFull => "NEIGHBOR_TABLE_FULL",
            NwkStatus::RouteDiscoveryFailed => "ROUTE_DISCOVERY_FAILED",
            NwkStatus::RouteError => "ROUTE_ERROR",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Request parameters
// ============================================================================

/// Parameters of the coordinator's network formation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationParams {
    /// Channel bitmap to scan (bit n = channel n)
    pub channel_mask: u32,
    pub scan_duration: u8,
    pub beacon_order: u8,
    pub superframe_order: u8,
}

impl Default for FormationParams {
    fn default() -> Self {
        Self {
            channel_mask: ALL_CHANNELS,
            scan_duration: 0,
            beacon_order: 15,
            superframe_order: 15,
        }
    }
}

/// Parameters of a joining device's network discovery request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryParams {
    pub channel_mask: u32,
    pub scan_duration: u8,
}

impl Default for DiscoveryParams {
    fn default() -> Self {
        Self {
            channel_mask: LOW_CHANNELS,
            scan_duration: 2,
        }
    }
}

/// One network found during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDescriptor {
    pub extended_pan_id: ExtAddress,
    pub channel: u8,
    pub pan_id: PanId,
    pub stack_profile: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoiningMethod {
    Association,
    DirectOrRejoin,
    Rejoin,
    ChangeChannel,
}

/// Capability information field sent with an association request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityInformation {
    pub alternate_pan_coordinator: bool,
    /// Full function device able to route
    pub router: bool,
    pub mains_powered: bool,
    pub receiver_on_when_idle: bool,
    pub security: bool,
    /// Ask the parent to allocate a short address
    pub allocate_address: bool,
}

impl CapabilityInformation {
    const ALT_PAN_COORD: u8 = 0x01;
    const DEVICE_TYPE: u8 = 0x02;
    const POWER_SOURCE: u8 = 0x04;
    const RX_ON_IDLE: u8 = 0x08;
    const SECURITY: u8 = 0x40;
    const ALLOCATE_ADDR: u8 = 0x80;

    /// Join capabilities for a device of the given role, always with address allocation on.
    pub fn for_role(role: DeviceRole) -> Self {
        let router = role.routes();
        Self {
            router,
            mains_powered: router,
            receiver_on_when_idle: router,
            allocate_address: true,
            ..Default::default()
        }
    }

    pub fn to_bits(&self) -> u8 {
        let mut bits = 0;
        if self.alternate_pan_coordinator {
            bits |= Self::ALT_PAN_COORD;
        }
        if self.router {
            bits |= Self::DEVICE_TYPE;
        }
        if self.mains_powered {
            bits |= Self::POWER_SOURCE;
        }
        if self.receiver_on_when_idle {
            bits |= Self::RX_ON_IDLE;
        }
        if self.security {
            bits |= Self::SECURITY;
        }
        if self.allocate_address {
            bits |= Self::ALLOCATE_ADDR;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            alternate_pan_coordinator: bits & Self::ALT_PAN_COORD != 0,
            router: bits & Self::DEVICE_TYPE != 0,
            mains_powered: bits & Self::POWER_SOURCE != 0,
            receiver_on_when_idle: bits & Self::RX_ON_IDLE != 0,
            security: bits & Self::SECURITY != 0,
            allocate_address: bits & Self::ALLOCATE_ADDR != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinParams {
    pub extended_pan_id: ExtAddress,
    /// Packed `CapabilityInformation`
    pub capability: u8,
    pub rejoin_network: JoiningMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataRequestParams {
    pub destination: NwkAddress,
    pub handle: u8,
    pub discover_route: bool,
}

/// Application payload handed to the network layer.
///
/// The tag is opaque to the stack; only the harness reads and writes it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppPayload {
    pub data: Vec<u8>,
    pub tag: Option<[u8; PACKET_TAG_SIZE]>,
}

impl AppPayload {
    /// Zero-filled payload of `size` bytes without a tag.
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: vec![0; size],
            tag: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ============================================================================
// Collaborator events
// ============================================================================

/// Confirmations and indications emitted by the network layer, each bound to the
/// device that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
    FormationConfirm {
        device: DeviceIndex,
        status: NwkStatus,
    },
    DiscoveryConfirm {
        device: DeviceIndex,
        status: NwkStatus,
        networks: Vec<NetworkDescriptor>,
    },
    JoinConfirm {
        device: DeviceIndex,
        status: NwkStatus,
        network_address: NwkAddress,
        extended_pan_id: ExtAddress,
    },
    RouteDiscoveryConfirm {
        device: DeviceIndex,
        status: NwkStatus,
    },
    DataIndication {
        device: DeviceIndex,
        source: NwkAddress,
        payload: AppPayload,
    },
}

impl StackEvent {
    pub fn device(&self) -> DeviceIndex {
        match self {
            StackEvent::FormationConfirm { device, .. }
            | StackEvent::DiscoveryConfirm { device, .. }
            | StackEvent::JoinConfirm { device, .. }
            | StackEvent::RouteDiscoveryConfirm { device, .. }
            | StackEvent::DataIndication { device, .. } => *device,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StackEvent::FormationConfirm { .. } => "FormationConfirm",
            StackEvent::DiscoveryConfirm { .. } => "DiscoveryConfirm",
            StackEvent::JoinConfirm { .. } => "JoinConfirm",
            StackEvent::RouteDiscoveryConfirm { .. } => "RouteDiscoveryConfirm",
            StackEvent::DataIndication { .. } => "DataIndication",
        }
    }
}

/// An event the stack wants delivered `delay` after the request that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct StackOutput {
    pub delay: SimTime,
    pub event: StackEvent,
}

/// Answer of the route-discovery oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteLookup {
    NextHop { address: NwkAddress, neighbor: bool },
    Unreachable,
}

impl RouteLookup {
    /// Map a raw (address, neighbor) answer, treating the sentinel as unreachable.
    pub fn from_raw(address: NwkAddress, neighbor: bool) -> Self {
        if address == UNREACHABLE_ADDRESS {
            RouteLookup::Unreachable
        } else {
            RouteLookup::NextHop { address, neighbor }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Neighbor,
    Routing,
    RouteDiscovery,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Neighbor => "Neighbor Table",
            TableKind::Routing => "Routing Table",
            TableKind::RouteDiscovery => "Route Discovery Table",
        }
    }
}

/// The mesh network-layer stack driven by the harness.
///
/// Requests never block: anything the stack reports back is pushed into `out`
/// with the virtual-time delay after which it should be delivered.
pub trait MeshStack {
    fn formation_request(
        &mut self,
        device: DeviceIndex,
        params: &FormationParams,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    );

    fn discovery_request(
        &mut self,
        device: DeviceIndex,
        params: &DiscoveryParams,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    );

    fn join_request(
        &mut self,
        device: DeviceIndex,
        params: &JoinParams,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    );

    /// Fire-and-forget; no confirmation is produced.
    fn start_router_request(&mut self, device: DeviceIndex, now: SimTime);

    fn data_request(
        &mut self,
        device: DeviceIndex,
        params: &DataRequestParams,
        payload: AppPayload,
        now: SimTime,
        out: &mut Vec<StackOutput>,
    );

    /// Next hop from `device` toward `destination`.
    fn find_route(&self, device: DeviceIndex, destination: NwkAddress) -> RouteLookup;

    /// Human-readable diagnostic dump of one of the device's tables.
    fn dump_table(
        &self,
        device: DeviceIndex,
        kind: TableKind,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result;
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by the harness for debugging and analysis
#[derive(Debug, Clone, PartialEq)]
pub enum HarnessEvent {
    FormationConfirmed {
        status: NwkStatus,
    },
    NetworksDiscovered {
        count: usize,
    },
    JoinRequested {
        extended_pan_id: ExtAddress,
        as_router: bool,
    },
    Joined {
        network_address: NwkAddress,
        extended_pan_id: ExtAddress,
    },
    JoinFailed {
        status: NwkStatus,
        will_retry: bool,
    },
    RouterStarted,
    RouteDiscovery {
        status: NwkStatus,
    },
    PacketSent {
        packet_id: PacketId,
        destination: NwkAddress,
    },
    PacketReceived {
        packet_id: PacketId,
        delay: SimTime,
    },
    /// Tag present but no pending send with that id
    UnmatchedReception {
        packet_id: PacketId,
    },
    /// No tag at all
    UntaggedReception,
    /// Tag carrying id 0
    InvalidTag,
    TraceCompleted {
        status: TraceStatus,
        hops: usize,
    },
    TraceSkipped {
        source: NwkAddress,
        destination: NwkAddress,
    },
}

/// Trait for consuming events from the harness
pub trait EventSink {
    fn log(&mut self, time: SimTime, device: DeviceIndex, event: HarnessEvent);
}

/// Event sink that drops everything
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _time: SimTime, _device: DeviceIndex, _event: HarnessEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_conversion() {
        assert_eq!(seconds(1.0), MICROS_PER_SECOND);
        assert_eq!(seconds(0.5), 500_000);
        assert_eq!(seconds(0.01), 10_000);
        assert_eq!(seconds(-3.0), 0);
        assert_eq!(as_seconds(seconds(12.5)), 12.5);
    }

    #[test]
    fn test_address_formatting() {
        assert_eq!(fmt_short(0xCAFE), "CA:FE");
        assert_eq!(fmt_short(0x0001), "00:01");
        assert_eq!(fmt_extended(0xCAFE), "00:00:00:00:00:00:CA:FE");
    }

    #[test]
    fn test_capability_bits_by_role() {
        let router = CapabilityInformation::for_role(DeviceRole::Router);
        assert!(router.router);
        assert!(router.allocate_address);
        assert_eq!(router.to_bits() & 0x02, 0x02);

        let end_device = CapabilityInformation::for_role(DeviceRole::EndDevice);
        assert!(!end_device.router);
        assert!(end_device.allocate_address);
        assert_eq!(end_device.to_bits(), 0x80);

        assert_eq!(CapabilityInformation::from_bits(router.to_bits()), router);
    }

    #[test]
    fn test_route_lookup_sentinel() {
        assert_eq!(
            RouteLookup::from_raw(UNREACHABLE_ADDRESS, true),
            RouteLookup::Unreachable
        );
        assert_eq!(
            RouteLookup::from_raw(0x1234, false),
            RouteLookup::NextHop {
                address: 0x1234,
                neighbor: false
            }
        );
    }

    #[test]
    fn test_stack_event_device() {
        let event = StackEvent::JoinConfirm {
            device: 7,
            status: NwkStatus::Success,
            network_address: 0x1234,
            extended_pan_id: 0xCAFE,
        };
        assert_eq!(event.device(), 7);
        assert_eq!(event.as_str(), "JoinConfirm");
    }
}
