//! Run configuration
//!
//! Every section has defaults reproducing the ten device reference run, so a
//! scenario file only needs to name what it changes. Times are given in seconds.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::zm_devices::{DeviceRegistry, PartitionError, RolePartition};
use crate::zm_interface::{seconds, DeviceIndex, ExtAddress, SimTime};
use crate::zm_sequencer::BringupConfig;
use crate::zm_sim_stack::NetworkConfig;
use crate::zm_trace::TraceConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scenario YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("{field} refers to device {device}, but only {count} devices exist")]
    DeviceOutOfRange {
        field: &'static str,
        device: DeviceIndex,
        count: usize,
    },

    #[error("{field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ============================================================================
// Sections
// ============================================================================

/// Mesh population: one coordinator, then routers, then end devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of routers (default: 4)
    pub routers: usize,

    /// Number of end devices (default: 5)
    pub end_devices: usize,

    /// Extended address of the coordinator (default: 0xCAFE)
    pub coordinator_extended_address: ExtAddress,

    /// Explicit extended addresses, one per device; generated when absent
    pub extended_addresses: Option<Vec<ExtAddress>>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            routers: 4,
            end_devices: 5,
            coordinator_extended_address: 0xCAFE,
            extended_addresses: None,
        }
    }
}

impl DeviceConfig {
    pub fn count(&self) -> usize {
        1 + self.routers + self.end_devices
    }

    pub fn partition(&self) -> RolePartition {
        RolePartition::contiguous(self.routers, self.end_devices)
    }

    pub fn resolve_extended_addresses(&self) -> Vec<ExtAddress> {
        self.extended_addresses.clone().unwrap_or_else(|| {
            DeviceRegistry::default_extended_addresses(
                self.count(),
                self.coordinator_extended_address,
            )
        })
    }

    pub fn build_registry(&self) -> Result<DeviceRegistry, PartitionError> {
        DeviceRegistry::new(self.partition(), &self.resolve_extended_addresses())
    }
}

/// Application traffic between one source and one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Sending device ordinal (default: 4)
    pub source: DeviceIndex,

    /// Receiving device ordinal (default: 6)
    pub destination: DeviceIndex,

    /// First send, seconds (default: 12.0)
    pub start_s: f64,

    /// Send interval, seconds (default: 0.5)
    pub interval_s: f64,

    /// Packets to send (default: 200)
    pub packets: u32,

    /// Payload bytes, excluding the id tag (default: 5)
    pub payload_size: usize,

    /// Wait after the last send before results are computed, seconds (default: 10.0)
    pub safety_margin_s: f64,

    /// Wait after results before the run stops, seconds (default: 5.0)
    pub teardown_delay_s: f64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            source: 4,
            destination: 6,
            start_s: 12.0,
            interval_s: 0.5,
            packets: 200,
            payload_size: 5,
            safety_margin_s: 10.0,
            teardown_delay_s: 5.0,
        }
    }
}

impl TrafficConfig {
    /// Send time of packet `i` (0-based).
    pub fn send_time(&self, i: u32) -> SimTime {
        seconds(self.start_s + i as f64 * self.interval_s)
    }

    pub fn end_of_transmission(&self) -> SimTime {
        seconds(self.start_s + self.packets as f64 * self.interval_s)
    }

    /// Results are computed here.
    pub fn deadline(&self) -> SimTime {
        seconds(self.start_s + self.packets as f64 * self.interval_s + self.safety_margin_s)
    }

    /// Half a second before the deadline, unless that falls inside transmission.
    pub fn table_dump_time(&self) -> SimTime {
        let deadline = self.deadline();
        let early = deadline.saturating_sub(seconds(0.5));
        if early < self.end_of_transmission() {
            deadline
        } else {
            early
        }
    }

    pub fn stop_time(&self) -> SimTime {
        self.deadline()
            .saturating_add(seconds(self.teardown_delay_s))
    }
}

/// Diagnostics taken near the end of the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Device whose tables are dumped (default: 1)
    pub device: DeviceIndex,

    pub dump_neighbor_table: bool,
    pub dump_routing_table: bool,

    /// Route discovery table, dumped shortly after traffic starts (default: false)
    pub dump_route_discovery_table: bool,

    pub trace: TraceConfig,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            device: 1,
            dump_neighbor_table: true,
            dump_routing_table: true,
            dump_route_discovery_table: false,
            trace: TraceConfig::default(),
        }
    }
}

// ============================================================================
// Harness configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub devices: DeviceConfig,
    pub bringup: BringupConfig,
    pub traffic: TrafficConfig,
    pub inspection: InspectionConfig,
    pub network: NetworkConfig,

    /// Random seed (None = generate random, default: 3)
    pub seed: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            devices: DeviceConfig::default(),
            bringup: BringupConfig::default(),
            traffic: TrafficConfig::default(),
            inspection: InspectionConfig::default(),
            network: NetworkConfig::default(),
            seed: Some(3),
        }
    }
}

/// Latest virtual time a run may reach, in seconds (about 31 years).
pub const MAX_RUN_TIME_S: f64 = 1e9;

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        within_run(field, value)
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("must be a non-negative number of seconds, got {}", value),
        })
    }
}

fn within_run(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value <= MAX_RUN_TIME_S {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: format!("{} s is past the {} s run limit", value, MAX_RUN_TIME_S),
        })
    }
}

fn in_range(field: &'static str, device: DeviceIndex, count: usize) -> Result<(), ConfigError> {
    if device < count {
        Ok(())
    } else {
        Err(ConfigError::DeviceOutOfRange {
            field,
            device,
            count,
        })
    }
}

impl HarnessConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Get or generate seed
    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| rand::thread_rng().gen())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let count = self.devices.count();
        let addresses = self.devices.resolve_extended_addresses();
        if addresses.len() != count {
            return Err(ConfigError::InvalidValue {
                field: "devices.extended_addresses",
                reason: format!("{} addresses for {} devices", addresses.len(), count),
            });
        }
        // runs the partition and duplicate address checks
        DeviceRegistry::new(self.devices.partition(), &addresses)?;

        in_range("traffic.source", self.traffic.source, count)?;
        in_range("traffic.destination", self.traffic.destination, count)?;
        in_range("inspection.device", self.inspection.device, count)?;

        non_negative("bringup.formation_time_s", self.bringup.formation_time_s)?;
        non_negative("bringup.discovery_start_s", self.bringup.discovery_start_s)?;
        non_negative("bringup.discovery_stagger_s", self.bringup.discovery_stagger_s)?;
        non_negative("bringup.join_retry.backoff_s", self.bringup.join_retry.backoff_s)?;
        non_negative("traffic.start_s", self.traffic.start_s)?;
        non_negative("traffic.interval_s", self.traffic.interval_s)?;
        non_negative("traffic.safety_margin_s", self.traffic.safety_margin_s)?;
        non_negative("traffic.teardown_delay_s", self.traffic.teardown_delay_s)?;
        non_negative("network.per_hop_delay_s", self.network.per_hop_delay_s)?;
        non_negative("network.per_hop_jitter_s", self.network.per_hop_jitter_s)?;
        non_negative("network.route_discovery_delay_s", self.network.route_discovery_delay_s)?;
        non_negative("network.join_delay_s", self.network.join_delay_s)?;

        if !(0.0..=1.0).contains(&self.network.loss_fraction) {
            return Err(ConfigError::InvalidValue {
                field: "network.loss_fraction",
                reason: format!("must be within 0..=1, got {}", self.network.loss_fraction),
            });
        }
        if self.traffic.packets > 0 && self.traffic.interval_s <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "traffic.interval_s",
                reason: "must be positive when packets are sent".to_string(),
            });
        }
        within_run(
            "traffic",
            self.traffic.start_s
                + self.traffic.packets as f64 * self.traffic.interval_s
                + self.traffic.safety_margin_s
                + self.traffic.teardown_delay_s,
        )?;
        within_run(
            "bringup.discovery_stagger_s",
            self.bringup.discovery_start_s + count as f64 * self.bringup.discovery_stagger_s,
        )?;
        if self.inspection.trace.loop_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inspection.trace.loop_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        for &(a, b) in &self.network.links {
            in_range("network.links", a.max(b), count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reference_run() {
        let config = HarnessConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.devices.count(), 10);
        assert_eq!(config.seed, Some(3));
        assert_eq!(config.resolve_seed(), 3);
        assert_eq!(config.traffic.send_time(0), seconds(12.0));
        assert_eq!(config.traffic.send_time(199), seconds(111.5));
        assert_eq!(config.traffic.end_of_transmission(), seconds(112.0));
        assert_eq!(config.traffic.deadline(), seconds(122.0));
        assert_eq!(config.traffic.table_dump_time(), seconds(121.5));
        assert_eq!(config.traffic.stop_time(), seconds(127.0));
    }

    #[test]
    fn test_table_dump_without_margin_waits_for_deadline() {
        let traffic = TrafficConfig {
            safety_margin_s: 0.2,
            ..Default::default()
        };
        assert_eq!(traffic.table_dump_time(), traffic.deadline());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
devices:
  routers: 2
  end_devices: 2
traffic:
  source: 1
  destination: 4
  packets: 20
network:
  links: [[0, 1], [0, 2], [1, 3], [2, 4]]
  loss_fraction: 0.1
seed: 42
"#;
        let config = HarnessConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.devices.count(), 5);
        assert_eq!(config.traffic.packets, 20);
        assert_eq!(config.traffic.interval_s, 0.5);
        assert_eq!(config.network.links.len(), 4);
        assert_eq!(config.network.max_children, 20);
        assert_eq!(config.bringup.formation_time_s, 1.0);
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn test_rejects_out_of_range_traffic() {
        let mut config = HarnessConfig::default();
        config.traffic.destination = 10;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::DeviceOutOfRange {
                field: "traffic.destination",
                device: 10,
                count: 10
            })
        ));
    }

    #[test]
    fn test_rejects_times_past_run_limit() {
        let mut config = HarnessConfig::default();
        config.traffic.start_s = 1e19;
        config.traffic.packets = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "traffic.start_s",
                ..
            })
        ));

        let mut config = HarnessConfig::default();
        config.traffic.packets = u32::MAX;
        config.traffic.interval_s = 1e6;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "traffic",
                ..
            })
        ));

        let mut config = HarnessConfig::default();
        config.bringup.discovery_stagger_s = 5e8;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "bringup.discovery_stagger_s",
                ..
            })
        ));
    }

    #[test]
    fn test_stop_time_saturates() {
        let mut traffic = TrafficConfig::default();
        traffic.start_s = 1e19;
        traffic.packets = 1;
        assert_eq!(traffic.deadline(), SimTime::MAX);
        assert_eq!(traffic.stop_time(), SimTime::MAX);
    }

    #[test]
    fn test_rejects_bad_loss_fraction() {
        let mut config = HarnessConfig::default();
        config.network.loss_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "network.loss_fraction",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_duplicate_extended_addresses() {
        let mut config = HarnessConfig::default();
        config.devices.routers = 1;
        config.devices.end_devices = 1;
        config.devices.extended_addresses = Some(vec![0xCAFE, 7, 7]);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Partition(PartitionError::DuplicateExtendedAddress(_)))
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = HarnessConfig::from_yaml_str("traffic: [unterminated");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = HarnessConfig::load(Path::new("/nonexistent/scenario.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
