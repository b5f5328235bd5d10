//! Mesh harness run
//!
//! Owns every piece of per-run state (device registry, sequencer, packet
//! correlator, event queue) and drives the network stack from a single
//! dispatcher. Bring-up requests, data sends, table dumps, the trace and the
//! final metrics are all events on the same virtual clock.

use log::{error, info, warn};
use thiserror::Error;

use crate::zm_config::{ConfigError, HarnessConfig};
use crate::zm_devices::{DeviceRegistry, JoinState};
use crate::zm_interface::{
    as_seconds, fmt_extended, fmt_short, seconds, AppPayload, DataRequestParams, DeviceIndex,
    DeviceRole, EventSink, ExtAddress, HarnessEvent, MeshStack, NoOpSink, NwkAddress, SimTime,
    StackEvent, StackOutput, TableKind, UNASSIGNED_ADDRESS,
};
use crate::zm_metrics::{MetricsReport, PacketCorrelator, ReceiveOutcome};
use crate::zm_scheduler::{ScheduleError, Scheduler};
use crate::zm_sequencer::{BringupError, BringupRequest, BringupSequencer, ScheduledRequest};
use crate::zm_sim_stack::SimMeshStack;
use crate::zm_trace::{trace_route, StackOracle, TraceResult};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("bring-up aborted: {0}")]
    Bringup(#[from] BringupError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Everything that can happen on the harness clock
#[derive(Debug, Clone)]
enum Action {
    Issue {
        device: DeviceIndex,
        request: BringupRequest,
    },
    Deliver(StackEvent),
    SendData,
    DumpTable {
        device: DeviceIndex,
        kind: TableKind,
    },
    TraceRoute,
    Finalize,
    Stop,
}

// ============================================================================
// Run report
// ============================================================================

/// Final state of one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSummary {
    pub index: DeviceIndex,
    pub role: DeviceRole,
    pub state: JoinState,
    pub network_address: NwkAddress,
    pub extended_address: ExtAddress,
}

/// Text of one diagnostic table dump
#[derive(Debug, Clone, PartialEq)]
pub struct TableDump {
    pub time: SimTime,
    pub device: DeviceIndex,
    pub kind: TableKind,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub seed: Option<u64>,
    pub metrics: MetricsReport,
    pub devices: Vec<DeviceSummary>,
    pub trace: Option<TraceResult>,
    pub tables: Vec<TableDump>,
    pub finished_at: SimTime,
}

impl RunReport {
    pub fn associated_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.state.is_associated())
            .count()
    }

    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        Mesh Bring-up & Delivery Results                ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        if let Some(seed) = self.seed {
            println!("Seed: {}", seed);
        }
        println!("Finished at: {:.2} s\n", as_seconds(self.finished_at));

        println!(
            "Devices ({} of {} associated):",
            self.associated_count(),
            self.devices.len()
        );
        for device in &self.devices {
            println!(
                "  Node {:>2} {:<4} {:<20} {} | {}",
                device.index,
                device.role.as_str(),
                device.state.as_str(),
                fmt_short(device.network_address),
                fmt_extended(device.extended_address)
            );
        }

        for table in &self.tables {
            println!("\nTime {:.2} s", as_seconds(table.time));
            print!("{}", table.text);
        }

        if let Some(trace) = &self.trace {
            trace.print_summary();
        }

        self.metrics.print_summary();
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Single-threaded discrete-event harness around a `MeshStack`.
pub struct MeshHarness<S: MeshStack, K: EventSink = NoOpSink> {
    config: HarnessConfig,
    seed: Option<u64>,
    registry: DeviceRegistry,
    sequencer: BringupSequencer,
    correlator: PacketCorrelator,
    scheduler: Scheduler<Action>,
    stack: S,
    sink: K,
    stack_out: Vec<StackOutput>,
    next_handle: u8,
    tables: Vec<TableDump>,
    trace: Option<TraceResult>,
    metrics: Option<MetricsReport>,
}

impl<K: EventSink> MeshHarness<SimMeshStack, K> {
    /// Harness over the in-memory stack, seeded from the configuration.
    pub fn simulated(config: HarnessConfig, sink: K) -> Result<Self, HarnessError> {
        config.validate()?;
        let seed = config.resolve_seed();
        let stack = SimMeshStack::new(
            &config.devices.resolve_extended_addresses(),
            config.network.clone(),
            seed,
        );
        let mut harness = Self::new(config, stack, sink)?;
        harness.seed = Some(seed);
        Ok(harness)
    }
}

impl<S: MeshStack, K: EventSink> MeshHarness<S, K> {
    pub fn new(config: HarnessConfig, stack: S, sink: K) -> Result<Self, HarnessError> {
        config.validate()?;
        let registry = config
            .devices
            .build_registry()
            .map_err(ConfigError::from)?;
        let sequencer = BringupSequencer::new(config.bringup.clone());

        let mut harness = Self {
            config,
            seed: None,
            registry,
            sequencer,
            correlator: PacketCorrelator::new(),
            scheduler: Scheduler::new(),
            stack,
            sink,
            stack_out: Vec::new(),
            next_handle: 0,
            tables: Vec::new(),
            trace: None,
            metrics: None,
        };
        harness.schedule_plan()?;
        Ok(harness)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn correlator(&self) -> &PacketCorrelator {
        &self.correlator
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Lay out the whole run on the clock before it starts.
    fn schedule_plan(&mut self) -> Result<(), ScheduleError> {
        for ScheduledRequest {
            device,
            delay,
            request,
        } in self.sequencer.initial_schedule(&self.registry)
        {
            self.scheduler
                .schedule_at(delay, Action::Issue { device, request })?;
        }

        let traffic = self.config.traffic.clone();
        for i in 0..traffic.packets {
            self.scheduler
                .schedule_at(traffic.send_time(i), Action::SendData)?;
        }

        let inspection = self.config.inspection.clone();
        if inspection.dump_route_discovery_table {
            self.scheduler.schedule_at(
                seconds(traffic.start_s + 0.02),
                Action::DumpTable {
                    device: inspection.device,
                    kind: TableKind::RouteDiscovery,
                },
            )?;
        }

        let dump_at = traffic.table_dump_time();
        if inspection.dump_neighbor_table {
            self.scheduler.schedule_at(
                dump_at,
                Action::DumpTable {
                    device: inspection.device,
                    kind: TableKind::Neighbor,
                },
            )?;
        }
        if inspection.dump_routing_table {
            self.scheduler.schedule_at(
                dump_at.saturating_add(seconds(0.01)),
                Action::DumpTable {
                    device: inspection.device,
                    kind: TableKind::Routing,
                },
            )?;
        }
        self.scheduler
            .schedule_at(dump_at.saturating_add(seconds(0.03)), Action::TraceRoute)?;

        self.scheduler
            .schedule_at(traffic.deadline(), Action::Finalize)?;
        self.scheduler
            .schedule_at(traffic.stop_time(), Action::Stop)?;
        Ok(())
    }

    /// Run until the stop event, or abort on the first fatal bring-up failure.
    pub fn run(&mut self) -> Result<RunReport, HarnessError> {
        info!(
            "starting run: {} devices, {} packets {} -> {}",
            self.registry.len(),
            self.config.traffic.packets,
            self.config.traffic.source,
            self.config.traffic.destination
        );

        while let Some((now, action)) = self.scheduler.pop() {
            match action {
                Action::Stop => break,
                Action::Issue { device, request } => self.issue(device, request, now),
                Action::Deliver(event) => {
                    if let Err(e) = self.dispatch(event, now) {
                        error!("T={:.3}s run aborted: {}", as_seconds(now), e);
                        return Err(e.into());
                    }
                }
                Action::SendData => self.send_data(now),
                Action::DumpTable { device, kind } => self.dump_table(device, kind, now),
                Action::TraceRoute => self.trace(now),
                Action::Finalize => {
                    info!("T={:.3}s computing results", as_seconds(now));
                    self.metrics = Some(self.correlator.finalize());
                }
            }
        }

        info!(
            "T={:.3}s run finished: {} of {} devices associated, {} unassociated",
            as_seconds(self.scheduler.now()),
            self.registry.associated_count(),
            self.registry.len(),
            self.registry.count_in_state(JoinState::Unassociated)
        );
        Ok(self.report())
    }

    fn issue(&mut self, device: DeviceIndex, request: BringupRequest, now: SimTime) {
        self.sequencer
            .record_issued(&mut self.registry, device, &request);
        match &request {
            BringupRequest::Formation(params) => {
                self.stack
                    .formation_request(device, params, now, &mut self.stack_out)
            }
            BringupRequest::Discovery(params) => {
                self.stack
                    .discovery_request(device, params, now, &mut self.stack_out)
            }
            BringupRequest::Join(params) => {
                self.stack
                    .join_request(device, params, now, &mut self.stack_out)
            }
            BringupRequest::StartRouter => self.stack.start_router_request(device, now),
        }
        self.enqueue_stack_output();
    }

    fn enqueue_stack_output(&mut self) {
        for output in self.stack_out.drain(..) {
            self.scheduler
                .schedule_in(output.delay, Action::Deliver(output.event));
        }
    }

    /// Route a stack event: data to the correlator, confirmations to the sequencer.
    fn dispatch(&mut self, event: StackEvent, now: SimTime) -> Result<(), BringupError> {
        if let StackEvent::DataIndication {
            device, payload, ..
        } = &event
        {
            let logged = match self.correlator.receive(payload, now) {
                ReceiveOutcome::Matched { packet_id, delay } => {
                    HarnessEvent::PacketReceived { packet_id, delay }
                }
                ReceiveOutcome::Unmatched { packet_id } => {
                    HarnessEvent::UnmatchedReception { packet_id }
                }
                ReceiveOutcome::Untagged => HarnessEvent::UntaggedReception,
                ReceiveOutcome::InvalidTag => HarnessEvent::InvalidTag,
            };
            self.sink.log(now, *device, logged);
            return Ok(());
        }

        let follow_ups =
            self.sequencer
                .handle_event(&mut self.registry, &event, now, &mut self.sink)?;
        for ScheduledRequest {
            device,
            delay,
            request,
        } in follow_ups
        {
            self.scheduler
                .schedule_in(delay, Action::Issue { device, request });
        }
        Ok(())
    }

    fn send_data(&mut self, now: SimTime) {
        let source = self.config.traffic.source;
        // resolved at send time, the destination may not have joined yet
        let destination = self
            .registry
            .network_address(self.config.traffic.destination);

        let mut payload = AppPayload::zeroed(self.config.traffic.payload_size);
        let packet_id = self.correlator.send(&mut payload, now);
        self.sink.log(
            now,
            source,
            HarnessEvent::PacketSent {
                packet_id,
                destination,
            },
        );

        let params = DataRequestParams {
            destination,
            handle: self.next_handle,
            discover_route: true,
        };
        self.next_handle = self.next_handle.wrapping_add(1);
        self.stack
            .data_request(source, &params, payload, now, &mut self.stack_out);
        self.enqueue_stack_output();
    }

    fn dump_table(&mut self, device: DeviceIndex, kind: TableKind, now: SimTime) {
        let mut text = String::new();
        if let Err(e) = self.stack.dump_table(device, kind, &mut text) {
            warn!("failed to dump {} of device {}: {}", kind.as_str(), device, e);
            return;
        }
        info!("T={:.3}s dumped {} of device {}", as_seconds(now), kind.as_str(), device);
        self.tables.push(TableDump {
            time: now,
            device,
            kind,
            text,
        });
    }

    fn trace(&mut self, now: SimTime) {
        let source = self.registry.network_address(self.config.traffic.source);
        let destination = self
            .registry
            .network_address(self.config.traffic.destination);

        if source == UNASSIGNED_ADDRESS || destination == UNASSIGNED_ADDRESS {
            warn!(
                "T={:.3}s trace skipped, source {} or destination {} has no address",
                as_seconds(now),
                fmt_short(source),
                fmt_short(destination)
            );
            self.sink.log(
                now,
                self.config.traffic.source,
                HarnessEvent::TraceSkipped {
                    source,
                    destination,
                },
            );
            return;
        }

        let oracle = StackOracle::new(&self.registry, &self.stack);
        let result = trace_route(
            &oracle,
            source,
            destination,
            &self.config.inspection.trace,
        );
        info!(
            "T={:.3}s trace {} -> {}: {} after {} hops",
            as_seconds(now),
            fmt_short(source),
            fmt_short(destination),
            result.status,
            result.hops.len()
        );
        self.sink.log(
            now,
            self.config.traffic.source,
            HarnessEvent::TraceCompleted {
                status: result.status,
                hops: result.hops.len(),
            },
        );
        self.trace = Some(result);
    }

    fn report(&self) -> RunReport {
        let devices = self
            .registry
            .iter()
            .map(|d| DeviceSummary {
                index: d.index,
                role: d.role,
                state: d.state,
                network_address: d.network_address,
                extended_address: d.extended_address,
            })
            .collect();

        RunReport {
            seed: self.seed,
            metrics: self
                .metrics
                .clone()
                .unwrap_or_else(|| self.correlator.finalize()),
            devices,
            trace: self.trace.clone(),
            tables: self.tables.clone(),
            finished_at: self.scheduler.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zm_event_sinks::CollectorEventSink;
    use crate::zm_interface::{NwkStatus, COORDINATOR_ADDRESS};
    use crate::zm_metrics::encode_tag;
    use crate::zm_trace::TraceStatus;

    fn run(config: HarnessConfig) -> (Result<RunReport, HarnessError>, CollectorEventSink) {
        let mut harness = MeshHarness::simulated(config, CollectorEventSink::new()).unwrap();
        let result = harness.run();
        (result, harness.into_sink())
    }

    #[test]
    fn test_reference_run_brings_up_every_device() {
        let (result, events) = run(HarnessConfig::default());
        let report = result.unwrap();

        assert_eq!(report.associated_count(), 10);
        assert_eq!(report.devices[0].state, JoinState::FormationConfirmed);
        assert_eq!(report.devices[0].network_address, COORDINATOR_ADDRESS);
        for device in &report.devices[1..=4] {
            assert_eq!(device.state, JoinState::RouterStarted);
        }
        for device in &report.devices[5..] {
            assert_eq!(device.state, JoinState::Ready);
        }
        assert_eq!(report.finished_at, seconds(127.0));
        assert_eq!(report.seed, Some(3));

        let joined = events.count_where(|e| matches!(e, HarnessEvent::Joined { .. }));
        assert_eq!(joined, 9);
    }

    #[test]
    fn test_reference_run_delivers_traffic() {
        let (result, events) = run(HarnessConfig::default());
        let report = result.unwrap();

        assert_eq!(report.metrics.sent, 200);
        assert_eq!(report.metrics.received, 200);
        assert_eq!(report.metrics.pdr, Some(1.0));
        let delay = report.metrics.delay.unwrap();
        assert_eq!(delay.samples, 200);
        assert!(delay.min > 0.0 && delay.min <= delay.average && delay.average <= delay.max);
        assert_eq!(
            events.count_where(|e| matches!(e, HarnessEvent::PacketSent { .. })),
            200
        );
        assert_eq!(
            events.count_where(|e| matches!(e, HarnessEvent::RouteDiscovery { .. })),
            1
        );
    }

    #[test]
    fn test_reference_run_traces_through_coordinator() {
        let (result, _) = run(HarnessConfig::default());
        let report = result.unwrap();

        let trace = report.trace.unwrap();
        assert_eq!(trace.status, TraceStatus::Reached);
        let devices: Vec<DeviceIndex> = trace.hops.iter().map(|h| h.device).collect();
        assert_eq!(devices, vec![4, 0, 1]);
        let last = trace.hops.last().unwrap();
        assert_eq!(last.next_hop, report.devices[6].network_address);
        assert!(last.neighbor);

        let kinds: Vec<TableKind> = report.tables.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TableKind::Neighbor, TableKind::Routing]);
        assert_eq!(report.tables[0].time, seconds(121.5));
        assert!(report.tables.iter().all(|t| t.device == 1));
    }

    #[test]
    fn test_formation_failure_aborts_run() {
        let mut config = HarnessConfig::default();
        config.bringup.formation.channel_mask = 0;

        let (result, _) = run(config);

        assert!(matches!(
            result,
            Err(HarnessError::Bringup(BringupError::FormationFailed {
                device: 0,
                status: NwkStatus::StartupFailure
            }))
        ));
    }

    #[test]
    fn test_discovery_on_wrong_channels_aborts_run() {
        let mut config = HarnessConfig::default();
        // network forms on channel 11, devices only scan 25 and 26
        config.bringup.discovery.channel_mask = 0x0600_0000;

        let (result, _) = run(config);

        assert!(matches!(
            result,
            Err(HarnessError::Bringup(BringupError::DiscoveryFailed { device: 1, .. }))
        ));
    }

    #[test]
    fn test_capacity_limit_leaves_devices_unassociated() {
        let mut config = HarnessConfig::default();
        config.network.max_children = 2;

        let (result, events) = run(config);
        let report = result.unwrap();

        assert_eq!(report.devices[3].state, JoinState::Unassociated);
        assert_eq!(report.devices[3].network_address, UNASSIGNED_ADDRESS);
        assert!(report.associated_count() < 10);
        assert!(events.count_where(|e| matches!(e, HarnessEvent::JoinFailed { .. })) >= 1);
        // the run itself still completes
        assert_eq!(report.metrics.sent, 200);
    }

    #[test]
    fn test_unassociated_destination_skips_trace() {
        let mut config = HarnessConfig::default();
        config.network.max_children = 2;
        config.traffic.destination = 3;
        config.traffic.packets = 10;

        let (result, events) = run(config);
        let report = result.unwrap();

        assert!(report.trace.is_none());
        assert_eq!(
            events.count_where(|e| matches!(e, HarnessEvent::TraceSkipped { .. })),
            1
        );
        assert_eq!(report.metrics.sent, 10);
        assert_eq!(report.metrics.received, 0);
        assert_eq!(report.metrics.pdr, Some(0.0));
        assert_eq!(report.metrics.delay, None);
    }

    #[test]
    fn test_no_traffic_reports_pdr_not_applicable() {
        let mut config = HarnessConfig::default();
        config.traffic.packets = 0;

        let (result, _) = run(config);
        let report = result.unwrap();

        assert_eq!(report.metrics.sent, 0);
        assert_eq!(report.metrics.pdr, None);
        assert_eq!(report.metrics.delay, None);
    }

    #[test]
    fn test_route_discovery_table_dump_is_optional() {
        let mut config = HarnessConfig::default();
        config.inspection.dump_route_discovery_table = true;
        config.inspection.device = 4;

        let (result, _) = run(config);
        let report = result.unwrap();

        assert_eq!(report.tables[0].kind, TableKind::RouteDiscovery);
        assert_eq!(report.tables[0].time, seconds(12.02));
    }

    #[test]
    fn test_anomalous_receptions_reach_the_sink_distinctly() {
        let mut harness =
            MeshHarness::simulated(HarnessConfig::default(), CollectorEventSink::new()).unwrap();
        let source = harness.registry().network_address(4);
        let indication = |payload: AppPayload| StackEvent::DataIndication {
            device: 6,
            source,
            payload,
        };

        let mut unknown = AppPayload::zeroed(5);
        unknown.tag = Some(encode_tag(77));
        let mut reserved = AppPayload::zeroed(5);
        reserved.tag = Some(encode_tag(0));

        for payload in [AppPayload::zeroed(5), unknown, reserved] {
            harness
                .dispatch(indication(payload), seconds(20.0))
                .unwrap();
        }

        let sink = harness.sink();
        assert_eq!(
            sink.count_where(|e| matches!(e, HarnessEvent::UntaggedReception)),
            1
        );
        assert_eq!(
            sink.count_where(|e| matches!(e, HarnessEvent::UnmatchedReception { packet_id: 77 })),
            1
        );
        assert_eq!(sink.count_where(|e| matches!(e, HarnessEvent::InvalidTag)), 1);
        assert_eq!(sink.for_device(6).count(), 3);
        assert_eq!(harness.correlator().received_count(), 0);
        assert_eq!(harness.correlator().sent_count(), 0);
        assert_eq!(harness.stack().frames_dropped(), 0);
    }

    #[test]
    fn test_run_past_time_limit_is_rejected_before_scheduling() {
        let mut config = HarnessConfig::default();
        config.traffic.start_s = 1e19;
        config.traffic.packets = 1;

        let result = MeshHarness::simulated(config, NoOpSink);

        assert!(matches!(
            result,
            Err(HarnessError::Config(ConfigError::InvalidValue {
                field: "traffic.start_s",
                ..
            }))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_running() {
        let mut config = HarnessConfig::default();
        config.traffic.source = 99;

        let result = MeshHarness::simulated(config, NoOpSink);

        assert!(matches!(
            result,
            Err(HarnessError::Config(ConfigError::DeviceOutOfRange { .. }))
        ));
    }
}
