use std::env;
use std::process;
use tripwire::telemetry::{init_tracing, LogFormat};
use tripwire::{BreakerSystem, SystemConfig};

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing(LogFormat::Compact) {
        eprintln!("{}", e);
    }

    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/tripwire.yaml".to_string());

    let config = match SystemConfig::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            eprintln!("Usage: tripwire [config_file]");
            process::exit(1);
        }
    };

    // Building the system validates every circuit and connects the backend
    let system = match BreakerSystem::from_config(&config).await {
        Ok(system) => system,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    for (name, state) in system.states().await {
        println!("{}\t{}", name, state);
    }
}
