//! Traceroute Demo
//!
//! Run with: cargo run --example traceroute_demo
//!
//! Runs the path tracer over a few hand-written routing tables: a healthy
//! chain, a two-node routing loop, a dead end, and a chain longer than the
//! hop budget.

use std::collections::HashMap;

use zm_rust::zm_interface::RouteLookup;
use zm_rust::{trace_route, DeviceIndex, NwkAddress, RouteOracle, TraceConfig};

/// Routing tables keyed by address; address `n` is held by device `n`.
struct TableOracle {
    next_hops: HashMap<NwkAddress, (NwkAddress, bool)>,
}

impl TableOracle {
    fn new(entries: &[(NwkAddress, NwkAddress, bool)]) -> Self {
        Self {
            next_hops: entries
                .iter()
                .map(|&(from, to, neighbor)| (from, (to, neighbor)))
                .collect(),
        }
    }
}

impl RouteOracle for TableOracle {
    fn locate(&self, address: NwkAddress) -> Option<DeviceIndex> {
        Some(address as DeviceIndex)
    }

    fn find_route(&self, device: DeviceIndex, _destination: NwkAddress) -> RouteLookup {
        match self.next_hops.get(&(device as NwkAddress)) {
            Some(&(next, neighbor)) => RouteLookup::from_raw(next, neighbor),
            None => RouteLookup::Unreachable,
        }
    }
}

fn main() {
    let config = TraceConfig::default();

    let cases: Vec<(&str, TableOracle, NwkAddress, NwkAddress)> = vec![
        (
            "Healthy chain",
            TableOracle::new(&[(0x0004, 0x0000, false), (0x0000, 0x0001, false), (0x0001, 0x0006, true)]),
            0x0004,
            0x0006,
        ),
        (
            "Routing loop",
            TableOracle::new(&[(0x0002, 0x0003, true), (0x0003, 0x0002, true)]),
            0x0002,
            0x0009,
        ),
        (
            "Dead end",
            TableOracle::new(&[(0x0004, 0x0000, true)]),
            0x0004,
            0x0007,
        ),
        (
            "Longer than the hop budget",
            TableOracle::new(&(1..64).map(|n| (n, n + 1, true)).collect::<Vec<_>>()),
            0x0001,
            0x0100,
        ),
    ];

    for (name, oracle, source, destination) in cases {
        println!("=== {} ===", name);
        let result = trace_route(&oracle, source, destination, &config);
        result.print_summary();
    }
}
