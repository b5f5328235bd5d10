//! # zmRust - Zigbee Mesh Bring-up Harness
//!
//! Drives a mesh network layer through coordinator formation, staggered device
//! discovery and join, and router start-up, then measures delivery between one
//! source and one destination and traces the route between them.
//!
//! ## Core Components
//!
//! - **BringupSequencer**: per-device state machine from idle to associated
//! - **PacketCorrelator**: packet id tagging, send/receive matching, PDR and latency
//! - **trace_route**: loop-aware hop-by-hop path tracer over a route oracle
//! - **DeviceRegistry**: devices by ordinal with a static role partition
//! - **MeshHarness**: discrete-event run over any `MeshStack` implementation
//!
//! ## Usage with a Network Layer
//!
//! The harness is stack-agnostic. Implement `MeshStack` for your network layer
//! (requests in, delayed confirmations and indications out), or use the
//! in-memory `SimMeshStack`:
//!
//! ```no_run
//! use zm_rust::{HarnessConfig, MeshHarness, NoOpSink};
//!
//! let mut harness = MeshHarness::simulated(HarnessConfig::default(), NoOpSink)?;
//! let report = harness.run()?;
//! report.print_summary();
//! # Ok::<(), zm_rust::HarnessError>(())
//! ```
//!
//! ## Scenarios
//!
//! `scenario_runner` loads YAML scenario files (see `scenarios/`) on top of the
//! default configuration.

pub mod zm_interface;
pub mod zm_devices;
pub mod zm_scheduler;
pub mod zm_sequencer;
pub mod zm_metrics;
pub mod zm_trace;
pub mod zm_sim_stack;
pub mod zm_config;
pub mod zm_event_sinks;
pub mod zm_harness;

// Re-export commonly used types
pub use zm_config::{ConfigError, HarnessConfig};
pub use zm_devices::{DeviceRegistry, JoinState, RolePartition};
pub use zm_interface::{
    DeviceIndex, DeviceRole, EventSink, HarnessEvent, MeshStack, NoOpSink, NwkAddress,
    NwkStatus, SimTime, StackEvent,
};
pub use zm_harness::{HarnessError, MeshHarness, RunReport};
pub use zm_metrics::{DelayStats, MetricsReport, PacketCorrelator};
pub use zm_sequencer::{BringupError, BringupSequencer};
pub use zm_sim_stack::{NetworkConfig, SimMeshStack};
pub use zm_trace::{trace_route, RouteOracle, TraceConfig, TraceResult, TraceStatus};
