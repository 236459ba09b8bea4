use clap::Parser;
use forklift::config::Args;
use forklift::{AppConfig, Forklift};
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AppConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Use --help for usage information");
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging.level) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("Starting forklift");
    info!("Default backend: {}", config.routing.default_backend);
    info!("Routing rules configured: {}", config.routing.rules.len());
    for (i, rule) in config.routing.rules.iter().enumerate() {
        let target = if rule.path.is_empty() {
            &rule.path_prefix
        } else {
            &rule.path
        };
        info!(
            "  {}. {} {} -> {} (priority: {}, percentage: {})",
            i + 1,
            if rule.method.is_empty() { "*" } else { &rule.method },
            target,
            rule.backend,
            rule.priority,
            rule.percentage
        );
    }

    let addr = match config.socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid listen address: {}", e);
            process::exit(1);
        }
    };

    let forklift = match Forklift::new(config.routing) {
        Ok(forklift) => Arc::new(forklift),
        Err(e) => {
            error!("Failed to create middleware: {}", e);
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    if let Err(e) = forklift.serve(listener).await {
        error!("Server error: {}", e);
        process::exit(1);
    }

    info!("Server shutdown complete");
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let mut filter_str = format!("forklift={},hyper=warn,tokio=warn", level);

    // Allow environment override
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        filter_str = env_filter;
    }

    let filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| format!("Invalid log filter '{}': {}", filter_str, e))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
