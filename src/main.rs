use log::{error, info};
use simple_logger::SimpleLogger;

use zm_rust::zm_event_sinks::LogEventSink;
use zm_rust::{HarnessConfig, MeshHarness};

fn main() {
    if let Err(e) = SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
    {
        eprintln!("failed to install logger: {}", e);
    }

    info!("starting");

    let config = HarnessConfig::default();
    let mut harness = match MeshHarness::simulated(config, LogEventSink) {
        Ok(harness) => harness,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    match harness.run() {
        Ok(report) => report.print_summary(),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
