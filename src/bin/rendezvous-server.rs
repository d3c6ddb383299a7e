//! Standalone rendezvous registry binary (spec §4.6, C6).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ghostline_core::config::RegistryConfig;
use ghostline_core::registry::{self, DeviceRegistry};

#[derive(Parser)]
#[command(name = "rendezvous-server", version, about = "Ghostline Signal rendezvous registry")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind to
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Device expiration time in seconds
    #[arg(long, default_value_t = 300)]
    expiration: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = RegistryConfig {
        device_expiry: Duration::from_secs(args.expiration),
        ..RegistryConfig::default()
    };
    let registry = Arc::new(DeviceRegistry::new(config));

    log::info!(
        "Ghostline Signal rendezvous server starting on {}:{} (expiry {}s)",
        args.host,
        args.port,
        args.expiration
    );

    if let Err(e) = registry::serve(registry, &args.host, args.port) {
        log::error!("rendezvous server exited: {e}");
        std::process::exit(1);
    }
}
