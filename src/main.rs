//! test-rest - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use test_rest::broker::DisabledBroker;
use test_rest::config::BrokerTransport;
use test_rest::{
    router, AppState, BrokerClient, InMemoryBroker, Listener, LoggingHandler, StompBroker,
    TestRestConfig,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "test-rest",
    about = "Controllable HTTP test double - canned responses, schema-gated payloads and broker forwarding",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "test-rest.yaml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        TestRestConfig::from_file(&args.config)
            .with_context(|| format!("invalid configuration {}", args.config.display()))?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration");
        TestRestConfig::default()
    };

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} destinations, broker {})",
            config.broker.destinations.len(),
            if config.broker.enabled { "enabled" } else { "disabled" }
        );
        return Ok(());
    }

    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    // Connect the broker client
    let broker: Arc<dyn BrokerClient> = match (config.broker.enabled, config.broker.transport) {
        (false, _) => Arc::new(DisabledBroker),
        (true, BrokerTransport::InMemory) => Arc::new(InMemoryBroker::from_settings(&config.broker)),
        (true, BrokerTransport::Stomp) => Arc::new(
            StompBroker::connect(&config.broker)
                .await
                .context("failed to connect to broker")?,
        ),
    };

    // Start consuming configured sources
    let listener = Listener::new(broker.clone(), Arc::new(LoggingHandler))
        .start_configured(&config.broker)
        .await
        .context("failed to start broker listener")?;

    // Bind and serve
    let app = router(AppState::from_config(&config, broker));
    let tcp = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    info!(
        listen = %config.server.listen,
        response_dir = %config.fixtures.response_dir.display(),
        schema_dir = %config.fixtures.schema_dir.display(),
        broker = config.broker.enabled,
        transport = ?config.broker.transport,
        "Starting test-rest"
    );

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the listener before exiting
    if let Some(handle) = listener {
        handle.shutdown().await;
    }
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
