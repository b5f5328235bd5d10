use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::zm_devices::{DeviceRegistry, JoinState};
use crate::zm_interface::{
    fmt_extended, fmt_short, seconds, CapabilityInformation, DeviceIndex, DeviceRole,
    DiscoveryParams, EventSink, FormationParams, HarnessEvent, JoinParams, JoiningMethod,
    NwkStatus, SimTime, StackEvent, COORDINATOR_ADDRESS,
};

// ============================================================================
// Configuration
// ============================================================================

/// What to do when a join confirmation reports failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRetryPolicy {
    /// Discovery/join cycles to re-run after a failed join (default: 0)
    pub max_retries: u32,

    /// Delay before discovery is re-issued, in seconds (default: 1.0)
    pub backoff_s: f64,
}

impl Default for JoinRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_s: 1.0,
        }
    }
}

/// Timing and parameters of the bring-up phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BringupConfig {
    /// Coordinator formation request time, seconds (default: 1.0)
    pub formation_time_s: f64,

    /// Discovery time of the first non-coordinator device, seconds (default: 3.0)
    pub discovery_start_s: f64,

    /// Offset between consecutive discovery requests, seconds (default: 1.0)
    pub discovery_stagger_s: f64,

    pub formation: FormationParams,
    pub discovery: DiscoveryParams,
    pub join_retry: JoinRetryPolicy,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            formation_time_s: 1.0,
            discovery_start_s: 3.0,
            discovery_stagger_s: 1.0,
            formation: FormationParams::default(),
            discovery: DiscoveryParams::default(),
            join_retry: JoinRetryPolicy::default(),
        }
    }
}

// ============================================================================
// Requests and errors
// ============================================================================

/// A network-layer request the sequencer wants issued on a device
#[derive(Debug, Clone, PartialEq)]
pub enum BringupRequest {
    Formation(FormationParams),
    Discovery(DiscoveryParams),
    Join(JoinParams),
    /// Fire-and-forget
    StartRouter,
}

impl BringupRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            BringupRequest::Formation(_) => "NLME-NETWORK-FORMATION.request",
            BringupRequest::Discovery(_) => "NLME-NETWORK-DISCOVERY.request",
            BringupRequest::Join(_) => "NLME-JOIN.request",
            BringupRequest::StartRouter => "NLME-START-ROUTER.request",
        }
    }
}

/// `request` to be issued on `device`, `delay` after the current time
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRequest {
    pub device: DeviceIndex,
    pub delay: SimTime,
    pub request: BringupRequest,
}

/// Conditions that abort the run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BringupError {
    #[error("network formation failed on device {device}: {status}")]
    FormationFailed {
        device: DeviceIndex,
        status: NwkStatus,
    },

    #[error("network discovery failed on device {device}: {status}")]
    DiscoveryFailed {
        device: DeviceIndex,
        status: NwkStatus,
    },

    #[error("device {device} found no network to join")]
    NoNetworkFound { device: DeviceIndex },

    #[error("confirmation for unknown device {0}")]
    UnknownDevice(DeviceIndex),
}

// ============================================================================
// Sequencer
// ============================================================================

/// Drives every device from idle to associated.
///
/// Each confirmation is resolved synchronously into either follow-up requests or a
/// terminal outcome for the device; nothing is left waiting on a callback.
pub struct BringupSequencer {
    config: BringupConfig,
}

impl BringupSequencer {
    pub fn new(config: BringupConfig) -> Self {
        Self { config }
    }

    /// Formation on the coordinator, then one discovery per remaining device in
    /// ordinal order, staggered.
    pub fn initial_schedule(&self, registry: &DeviceRegistry) -> Vec<ScheduledRequest> {
        let mut requests = Vec::with_capacity(registry.len());
        let formation_at = seconds(self.config.formation_time_s);
        let discovery_start = seconds(self.config.discovery_start_s);
        let stagger = seconds(self.config.discovery_stagger_s);

        let mut k: SimTime = 0;
        for device in registry.iter() {
            if device.role == DeviceRole::Coordinator {
                requests.push(ScheduledRequest {
                    device: device.index,
                    delay: formation_at,
                    request: BringupRequest::Formation(self.config.formation.clone()),
                });
            } else {
                requests.push(ScheduledRequest {
                    device: device.index,
                    delay: discovery_start.saturating_add(k.saturating_mul(stagger)),
                    request: BringupRequest::Discovery(self.config.discovery.clone()),
                });
                k += 1;
            }
        }
        requests
    }

    /// Move `device` into the state implied by issuing `request`.
    pub fn record_issued(
        &self,
        registry: &mut DeviceRegistry,
        device: DeviceIndex,
        request: &BringupRequest,
    ) {
        let Some(dev) = registry.get_mut(device) else {
            warn!("request {} for unknown device {}", request.as_str(), device);
            return;
        };
        dev.state = match request {
            BringupRequest::Formation(_) => JoinState::FormationRequested,
            BringupRequest::Discovery(_) => JoinState::DiscoveryRequested,
            BringupRequest::Join(_) => {
                dev.join_attempts += 1;
                JoinState::JoinRequested
            }
            BringupRequest::StartRouter => JoinState::RouterStarted,
        };
        debug!("device {} issued {}", device, request.as_str());
    }

    /// Resolve a confirmation into follow-up requests.
    ///
    /// Formation and discovery failures are fatal. A failed join is retried per the
    /// retry policy, after which the device is left unassociated.
    pub fn handle_event(
        &self,
        registry: &mut DeviceRegistry,
        event: &StackEvent,
        now: SimTime,
        sink: &mut dyn EventSink,
    ) -> Result<Vec<ScheduledRequest>, BringupError> {
        let device = event.device();
        let Some(dev) = registry.get_mut(device) else {
            return Err(BringupError::UnknownDevice(device));
        };

        match event {
            StackEvent::FormationConfirm { status, .. } => {
                sink.log(now, device, HarnessEvent::FormationConfirmed { status: *status });
                if dev.role != DeviceRole::Coordinator {
                    warn!("formation confirm on non-coordinator device {}, ignored", device);
                    return Ok(Vec::new());
                }
                if !status.is_success() {
                    error!("device {}: network formation failed ({})", device, status);
                    return Err(BringupError::FormationFailed {
                        device,
                        status: *status,
                    });
                }
                dev.network_address = COORDINATOR_ADDRESS;
                dev.state = JoinState::FormationConfirmed;
                info!("device {}: network formed, {}", device, dev.label());
                Ok(Vec::new())
            }

            StackEvent::DiscoveryConfirm {
                status, networks, ..
            } => {
                sink.log(
                    now,
                    device,
                    HarnessEvent::NetworksDiscovered {
                        count: networks.len(),
                    },
                );
                if !status.is_success() {
                    error!("device {}: network discovery failed ({})", device, status);
                    return Err(BringupError::DiscoveryFailed {
                        device,
                        status: *status,
                    });
                }
                let Some(network) = networks.first() else {
                    error!("device {}: discovery succeeded with no networks", device);
                    return Err(BringupError::NoNetworkFound { device });
                };

                dev.state = JoinState::DiscoveryConfirmed;
                let as_router = dev.role.routes();
                let params = JoinParams {
                    extended_pan_id: network.extended_pan_id,
                    capability: CapabilityInformation::for_role(dev.role).to_bits(),
                    rejoin_network: JoiningMethod::Association,
                };
                info!(
                    "device {}: joining {} on channel {} as {}",
                    device,
                    fmt_extended(network.extended_pan_id),
                    network.channel,
                    dev.role.as_str()
                );
                sink.log(
                    now,
                    device,
                    HarnessEvent::JoinRequested {
                        extended_pan_id: network.extended_pan_id,
                        as_router,
                    },
                );
                Ok(vec![ScheduledRequest {
                    device,
                    delay: 0,
                    request: BringupRequest::Join(params),
                }])
            }

            StackEvent::JoinConfirm {
                status,
                network_address,
                extended_pan_id,
                ..
            } => {
                if dev.state != JoinState::JoinRequested {
                    warn!(
                        "device {}: join confirm ({}) while {}, ignored",
                        device,
                        status,
                        dev.state.as_str()
                    );
                    return Ok(Vec::new());
                }
                if status.is_success() {
                    dev.network_address = *network_address;
                    dev.state = JoinState::JoinConfirmed;
                    info!(
                        "device {}: joined {} as {}",
                        device,
                        fmt_extended(*extended_pan_id),
                        fmt_short(*network_address)
                    );
                    sink.log(
                        now,
                        device,
                        HarnessEvent::Joined {
                            network_address: *network_address,
                            extended_pan_id: *extended_pan_id,
                        },
                    );

                    return Ok(match dev.role {
                        DeviceRole::Router => {
                            sink.log(now, device, HarnessEvent::RouterStarted);
                            vec![ScheduledRequest {
                                device,
                                delay: 0,
                                request: BringupRequest::StartRouter,
                            }]
                        }
                        _ => {
                            dev.state = JoinState::Ready;
                            Vec::new()
                        }
                    });
                }

                let policy = &self.config.join_retry;
                let will_retry = dev.join_attempts <= policy.max_retries;
                sink.log(now, device, HarnessEvent::JoinFailed {
                    status: *status,
                    will_retry,
                });

                if will_retry {
                    warn!(
                        "device {}: join failed ({}), retrying discovery (attempt {} of {})",
                        device,
                        status,
                        dev.join_attempts + 1,
                        policy.max_retries + 1
                    );
                    dev.state = JoinState::Idle;
                    Ok(vec![ScheduledRequest {
                        device,
                        delay: seconds(policy.backoff_s),
                        request: BringupRequest::Discovery(self.config.discovery.clone()),
                    }])
                } else {
                    warn!("device {}: join failed ({}), left unassociated", device, status);
                    dev.state = JoinState::Unassociated;
                    Ok(Vec::new())
                }
            }

            StackEvent::RouteDiscoveryConfirm { status, .. } => {
                debug!("device {}: route discovery {}", device, status);
                sink.log(now, device, HarnessEvent::RouteDiscovery { status: *status });
                Ok(Vec::new())
            }

            StackEvent::DataIndication { .. } => Ok(Vec::new()),
        }
    }
}
