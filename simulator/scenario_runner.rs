// Scenario Runner - Load and execute mesh scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/ten_node.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/lossy.yaml --seed 42

use std::env;
use std::fs;
use std::path::Path;

use log::LevelFilter;
use simple_logger::SimpleLogger;

use zm_rust::zm_event_sinks::{ConsoleEventSink, LogEventSink, MultiEventSink};
use zm_rust::{HarnessConfig, MeshHarness};

/// Scenario file: metadata plus configuration overrides
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    meta: ScenarioMeta,

    #[serde(default)]
    config: HarnessConfig,

    /// Print every harness event to stdout
    #[serde(default)]
    verbose: bool,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

fn main() {
    if let Err(e) = SimpleLogger::new().with_level(LevelFilter::Warn).init() {
        eprintln!("failed to install logger: {}", e);
    }

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/ten_node.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/lossy.yaml --seed 42", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    // Parse optional seed
    let seed: Option<u64> = if args.len() >= 4 && args[2] == "--seed" {
        Some(parse_seed(&args[3]))
    } else {
        None
    };

    let ok = if path.is_file() {
        run_scenario_file(path, seed)
    } else if path.is_dir() {
        run_scenario_directory(path, seed)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        false
    };

    if !ok {
        std::process::exit(1);
    }
}

fn run_scenario_directory(dir: &Path, seed: Option<u64>) -> bool {
    let mut scenarios = Vec::new();

    // Find all .yaml files
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some("yaml") || ext == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        return false;
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO RUNNER - Multiple Scenarios                 ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} scenario(s) to run\n", scenarios.len());

    let mut all_ok = true;
    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        all_ok &= run_scenario_file(scenario_path, seed);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  All scenarios complete!                               ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    all_ok
}

fn run_scenario_file(path: &Path, seed: Option<u64>) -> bool {
    println!("Loading scenario from: {}", path.display());

    let yaml_content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path.display(), e);
            return false;
        }
    };

    let scenario: ScenarioFile = match serde_yaml::from_str(&yaml_content) {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("Failed to parse {}: {}", path.display(), e);
            return false;
        }
    };

    // Print scenario header
    let name = scenario.meta.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scenario")
            .to_string()
    });
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  {}{}", name, " ".repeat(54_usize.saturating_sub(name.len())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let mut config = scenario.config;
    if seed.is_some() {
        config.seed = seed;
    }

    println!("Configuration:");
    println!(
        "  Devices: {} (1 coordinator, {} routers, {} end devices)",
        config.devices.count(),
        config.devices.routers,
        config.devices.end_devices
    );
    println!(
        "  Traffic: {} packets {} -> {} every {} s from {} s",
        config.traffic.packets,
        config.traffic.source,
        config.traffic.destination,
        config.traffic.interval_s,
        config.traffic.start_s
    );
    println!("  Loss per hop: {:.0}%", config.network.loss_fraction * 100.0);
    println!("\nStarting simulation...\n");

    let mut sink = MultiEventSink::new();
    sink.add_sink(Box::new(ConsoleEventSink::new(scenario.verbose)));
    sink.add_sink(Box::new(LogEventSink));

    let mut harness = match MeshHarness::simulated(config, sink) {
        Ok(harness) => harness,
        Err(e) => {
            eprintln!("Invalid scenario {}: {}", path.display(), e);
            return false;
        }
    };

    match harness.run() {
        Ok(report) => {
            report.print_summary();
            println!("\n✓ Scenario complete!\n");
            true
        }
        Err(e) => {
            eprintln!("\n✗ Scenario aborted: {}\n", e);
            false
        }
    }
}

/// Decimal or 0x-prefixed hexadecimal seed.
fn parse_seed(text: &str) -> u64 {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.unwrap_or_else(|e| {
        eprintln!("Invalid seed {}: {}", text, e);
        std::process::exit(1);
    })
}
