//! Event sinks for the harness event log

use crate::zm_interface::{
    as_seconds, fmt_extended, fmt_short, DeviceIndex, EventSink, HarnessEvent, SimTime,
};

/// One-line rendering of an event, shared by the console and log sinks.
pub fn describe(event: &HarnessEvent) -> String {
    match event {
        HarnessEvent::FormationConfirmed { status } => {
            format!("FormationConfirm status:{}", status)
        }
        HarnessEvent::NetworksDiscovered { count } => format!("DiscoveryConfirm networks:{}", count),
        HarnessEvent::JoinRequested {
            extended_pan_id,
            as_router,
        } => format!(
            "JoinRequest      epid:{} as:{}",
            fmt_extended(*extended_pan_id),
            if *as_router { "ZR" } else { "ZED" }
        ),
        HarnessEvent::Joined {
            network_address,
            extended_pan_id,
        } => format!(
            "Joined           addr:{} epid:{}",
            fmt_short(*network_address),
            fmt_extended(*extended_pan_id)
        ),
        HarnessEvent::JoinFailed { status, will_retry } => format!(
            "JoinFailed       status:{} {}",
            status,
            if *will_retry { "retrying" } else { "giving up" }
        ),
        HarnessEvent::RouterStarted => "StartRouter".to_string(),
        HarnessEvent::RouteDiscovery { status } => format!("RouteDiscovery   status:{}", status),
        HarnessEvent::PacketSent {
            packet_id,
            destination,
        } => format!("PacketSent       id:{} to:{}", packet_id, fmt_short(*destination)),
        HarnessEvent::PacketReceived { packet_id, delay } => format!(
            "PacketReceived   id:{} delay:{:.6}s",
            packet_id,
            as_seconds(*delay)
        ),
        HarnessEvent::UnmatchedReception { packet_id } => {
            format!("Unmatched        id:{}", packet_id)
        }
        HarnessEvent::UntaggedReception => "Untagged".to_string(),
        HarnessEvent::InvalidTag => "InvalidTag       id:0".to_string(),
        HarnessEvent::TraceCompleted { status, hops } => {
            format!("Trace            {} hops:{}", status, hops)
        }
        HarnessEvent::TraceSkipped {
            source,
            destination,
        } => format!(
            "TraceSkipped     src:{} dst:{}",
            fmt_short(*source),
            fmt_short(*destination)
        ),
    }
}

// ============================================================================
// Console Sink
// ============================================================================

/// Prints every event to stdout
pub struct ConsoleEventSink {
    enabled: bool,
}

impl ConsoleEventSink {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl EventSink for ConsoleEventSink {
    fn log(&mut self, time: SimTime, device: DeviceIndex, event: HarnessEvent) {
        if !self.enabled {
            return;
        }
        println!("{:>10.4} {:>4} {}", as_seconds(time), device, describe(&event));
    }
}

// ============================================================================
// Log Facade Sink
// ============================================================================

/// Forwards events to the `log` facade; data path anomalies at warn level.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn log(&mut self, time: SimTime, device: DeviceIndex, event: HarnessEvent) {
        let anomaly = matches!(
            event,
            HarnessEvent::JoinFailed { .. }
                | HarnessEvent::UnmatchedReception { .. }
                | HarnessEvent::UntaggedReception
                | HarnessEvent::InvalidTag
                | HarnessEvent::TraceSkipped { .. }
        );
        if anomaly {
            log::warn!("T={:.4}s node {}: {}", as_seconds(time), device, describe(&event));
        } else {
            log::info!("T={:.4}s node {}: {}", as_seconds(time), device, describe(&event));
        }
    }
}

// ============================================================================
// Collector Sink
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub time: SimTime,
    pub device: DeviceIndex,
    pub event: HarnessEvent,
}

/// Keeps every event in memory for later inspection
#[derive(Default)]
pub struct CollectorEventSink {
    events: Vec<EventRecord>,
}

impl CollectorEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    pub fn count_where(&self, pred: impl Fn(&HarnessEvent) -> bool) -> usize {
        self.events.iter().filter(|r| pred(&r.event)).count()
    }

    pub fn for_device(&self, device: DeviceIndex) -> impl Iterator<Item = &EventRecord> {
        self.events.iter().filter(move |r| r.device == device)
    }
}

impl EventSink for CollectorEventSink {
    fn log(&mut self, time: SimTime, device: DeviceIndex, event: HarnessEvent) {
        self.events.push(EventRecord {
            time,
            device,
            event,
        });
    }
}

// ============================================================================
// Multi Sink
// ============================================================================

/// Fans events out to several sinks
#[derive(Default)]
pub struct MultiEventSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for MultiEventSink {
    fn log(&mut self, time: SimTime, device: DeviceIndex, event: HarnessEvent) {
        for sink in &mut self.sinks {
            sink.log(time, device, event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zm_interface::NwkStatus;

    #[test]
    fn test_collector_keeps_order_and_filters() {
        let mut sink = CollectorEventSink::new();
        sink.log(10, 4, HarnessEvent::PacketSent {
            packet_id: 1,
            destination: 0x796F,
        });
        sink.log(20, 6, HarnessEvent::UntaggedReception);
        sink.log(30, 6, HarnessEvent::UnmatchedReception { packet_id: 9 });

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.events()[0].time, 10);
        assert_eq!(sink.for_device(6).count(), 2);
        assert_eq!(
            sink.count_where(|e| matches!(e, HarnessEvent::UntaggedReception)),
            1
        );
    }

    #[test]
    fn test_untagged_and_unmatched_render_differently() {
        let untagged = describe(&HarnessEvent::UntaggedReception);
        let unmatched = describe(&HarnessEvent::UnmatchedReception { packet_id: 9 });
        assert_ne!(untagged, unmatched);
        assert!(unmatched.contains("id:9"));
    }

    #[test]
    fn test_describe_join_failure() {
        let text = describe(&HarnessEvent::JoinFailed {
            status: NwkStatus::NeighborTableFull,
            will_retry: false,
        });
        assert!(text.contains("NEIGHBOR_TABLE_FULL"));
        assert!(text.contains("giving up"));
    }

    #[test]
    fn test_multi_sink_accepts_boxed_sinks() {
        let mut multi = MultiEventSink::new();
        multi.add_sink(Box::new(ConsoleEventSink::new(false)));
        multi.add_sink(Box::new(LogEventSink));
        multi.log(0, 0, HarnessEvent::RouterStarted);
    }
}
