//! Minimal demo: run a quick discovery scan against a serial port given
//! as the first command-line argument and print every device found.
//! No argument-parsing framework — that belongs to the CLI layer above
//! this crate.

use modbus_mesh::{DiscoveryScanner, ParameterGeneratorConfig, ScanCallbacks, ScanOptions, Strategy};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("usage: scan_demo <serial-port>");
        std::process::exit(1);
    });

    let scanner = DiscoveryScanner::new();
    let generator_cfg = ParameterGeneratorConfig { strategy: Strategy::Quick, ..Default::default() };
    let opts = ScanOptions { port, timeout_ms: 200, delay_ms: 100, max_devices: 0, verbose: true };

    let callbacks = ScanCallbacks {
        on_progress: Some(Box::new(|current, total, found| {
            info!(current, total, found, "scan progress");
            Ok(())
        })),
        on_device_found: Some(Box::new(|device| {
            info!(?device, "device found");
        })),
        ..Default::default()
    };

    match scanner.run(&generator_cfg, &opts, callbacks).await {
        Ok(devices) => {
            println!("found {} device(s)", devices.len());
            for device in devices {
                println!("{:?}", device);
            }
        }
        Err(err) => {
            eprintln!("scan aborted: {err}");
            std::process::exit(1);
        }
    }
}
