use crate::zm_interface::{
    fmt_extended, fmt_short, DeviceIndex, DeviceRole, ExtAddress, NwkAddress, UNASSIGNED_ADDRESS,
};
use thiserror::Error;

// ============================================================================
// Role Partition
// ============================================================================

/// A contiguous block of device ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrdinalRange {
    pub first: DeviceIndex,
    pub count: usize,
}

impl OrdinalRange {
    pub fn new(first: DeviceIndex, count: usize) -> Self {
        Self { first, count }
    }

    /// One past the last ordinal of the block.
    pub fn end(&self) -> DeviceIndex {
        self.first + self.count
    }

    pub fn contains(&self, ordinal: DeviceIndex) -> bool {
        ordinal >= self.first && ordinal < self.end()
    }
}

/// Static assignment of device ordinals to roles.
///
/// Exactly one coordinator at ordinal 0, followed by a contiguous block of routers
/// and then a contiguous block of end devices. The partition never changes during
/// a run; `role_of` is a pure lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePartition {
    pub coordinator: DeviceIndex,
    pub routers: OrdinalRange,
    pub end_devices: OrdinalRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("coordinator must be ordinal 0, found {0}")]
    CoordinatorNotFirst(DeviceIndex),

    #[error("{block} block must start at ordinal {expected}, found {found}")]
    NotContiguous {
        block: &'static str,
        expected: DeviceIndex,
        found: DeviceIndex,
    },

    #[error("partition covers {partition} devices but {devices} were configured")]
    CountMismatch { partition: usize, devices: usize },

    #[error("extended address {0} is assigned to more than one device")]
    DuplicateExtendedAddress(String),
}

impl RolePartition {
    /// Coordinator at 0, routers at `1..=routers`, end devices right after.
    pub fn contiguous(routers: usize, end_devices: usize) -> Self {
        Self {
            coordinator: 0,
            routers: OrdinalRange::new(1, routers),
            end_devices: OrdinalRange::new(1 + routers, end_devices),
        }
    }

    pub fn device_count(&self) -> usize {
        1 + self.routers.count + self.end_devices.count
    }

    pub fn role_of(&self, ordinal: DeviceIndex) -> Option<DeviceRole> {
        if ordinal == self.coordinator {
            Some(DeviceRole::Coordinator)
        } else if self.routers.contains(ordinal) {
            Some(DeviceRole::Router)
        } else if self.end_devices.contains(ordinal) {
            Some(DeviceRole::EndDevice)
        } else {
            None
        }
    }

    pub fn validate(&self, device_count: usize) -> Result<(), PartitionError> {
        if self.coordinator != 0 {
            return Err(PartitionError::CoordinatorNotFirst(self.coordinator));
        }
        if self.routers.first != 1 {
            return Err(PartitionError::NotContiguous {
                block: "router",
                expected: 1,
                found: self.routers.first,
            });
        }
        if self.end_devices.first != self.routers.end() {
            return Err(PartitionError::NotContiguous {
                block: "end device",
                expected: self.routers.end(),
                found: self.end_devices.first,
            });
        }
        if self.device_count() != device_count {
            return Err(PartitionError::CountMismatch {
                partition: self.device_count(),
                devices: device_count,
            });
        }
        Ok(())
    }
}

impl Default for RolePartition {
    fn default() -> Self {
        Self::contiguous(4, 5)
    }
}

// ============================================================================
// Device State Machine
// ============================================================================

/// Bring-up progress of a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    FormationRequested,
    /// Coordinator only
    FormationConfirmed,
    DiscoveryRequested,
    DiscoveryConfirmed,
    JoinRequested,
    JoinConfirmed,
    /// Router that has issued its start-router request
    RouterStarted,
    /// Joined end device
    Ready,
    /// Join failed and no retry is left
    Unassociated,
}

impl JoinState {
    /// True once the device holds a network address and participates in the mesh.
    pub fn is_associated(&self) -> bool {
        matches!(
            self,
            JoinState::FormationConfirmed
                | JoinState::JoinConfirmed
                | JoinState::RouterStarted
                | JoinState::Ready
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JoinState::Idle => "Idle",
            JoinState::FormationRequested => "FormationRequested",
            JoinState::FormationConfirmed => "FormationConfirmed",
            JoinState::DiscoveryRequested => "DiscoveryRequested",
            JoinState::DiscoveryConfirmed => "DiscoveryConfirmed",
            JoinState::JoinRequested => "JoinRequested",
            JoinState::JoinConfirmed => "JoinConfirmed",
            JoinState::RouterStarted => "RouterStarted",
            JoinState::Ready => "Ready",
            JoinState::Unassociated => "Unassociated",
        }
    }
}

/// A simulated device
#[derive(Debug, Clone)]
pub struct Device {
    pub index: DeviceIndex,
    pub extended_address: ExtAddress,
    pub network_address: NwkAddress,
    pub role: DeviceRole,
    pub state: JoinState,
    /// Join requests issued so far
    pub join_attempts: u32,
}

impl Device {
    pub fn label(&self) -> String {
        format!(
            "Node {} [{} | {}]",
            self.index,
            fmt_short(self.network_address),
            fmt_extended(self.extended_address)
        )
    }

    pub fn has_address(&self) -> bool {
        self.network_address != UNASSIGNED_ADDRESS
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Ordered collection of all devices of a run, addressed by ordinal.
pub struct DeviceRegistry {
    devices: Vec<Device>,
    partition: RolePartition,
}

impl DeviceRegistry {
    /// Build the registry for `partition`, one extended address per device.
    pub fn new(
        partition: RolePartition,
        extended_addresses: &[ExtAddress],
    ) -> Result<Self, PartitionError> {
        partition.validate(extended_addresses.len())?;

        let mut seen = std::collections::HashSet::new();
        for address in extended_addresses {
            if !seen.insert(*address) {
                return Err(PartitionError::DuplicateExtendedAddress(fmt_extended(
                    *address,
                )));
            }
        }

        let devices = extended_addresses
            .iter()
            .enumerate()
            .map(|(index, &extended_address)| Device {
                index,
                extended_address,
                network_address: UNASSIGNED_ADDRESS,
                // validate() guarantees every ordinal is covered
                role: partition.role_of(index).unwrap_or(DeviceRole::EndDevice),
                state: JoinState::Idle,
                join_attempts: 0,
            })
            .collect();

        Ok(Self {
            devices,
            partition,
        })
    }

    /// Coordinator gets `coordinator_address`, every other device its ordinal.
    pub fn default_extended_addresses(
        count: usize,
        coordinator_address: ExtAddress,
    ) -> Vec<ExtAddress> {
        (0..count)
            .map(|i| {
                if i == 0 {
                    coordinator_address
                } else {
                    i as ExtAddress
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: DeviceIndex) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn get_mut(&mut self, index: DeviceIndex) -> Option<&mut Device> {
        self.devices.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn coordinator(&self) -> Option<&Device> {
        self.devices.get(self.partition.coordinator)
    }

    /// Device currently holding network address `address`.
    pub fn by_network_address(&self, address: NwkAddress) -> Option<&Device> {
        if address == UNASSIGNED_ADDRESS {
            return None;
        }
        self.devices.iter().find(|d| d.network_address == address)
    }

    pub fn network_address(&self, index: DeviceIndex) -> NwkAddress {
        self.devices
            .get(index)
            .map(|d| d.network_address)
            .unwrap_or(UNASSIGNED_ADDRESS)
    }

    pub fn count_in_state(&self, state: JoinState) -> usize {
        self.devices.iter().filter(|d| d.state == state).count()
    }

    pub fn associated_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.state.is_associated())
            .count()
    }
}
