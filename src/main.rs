use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use gateway::{
    config::{Cli, GatewayConfig},
    logging::init_logging,
    server::{serve, shutdown_signal, AppContext},
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Invalid flags, environment or model configuration.
const EXIT_CONFIG: u8 = 2;
/// The listener could not bind or the server failed.
const EXIT_STARTUP: u8 = 1;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config, logging) = match cli.into_config() {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _log_guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build tokio runtime");
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> ExitCode {
    let address = config.bind_address();
    let ctx = match AppContext::new(config) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!(models = ctx.models.configs().len(), "Model configurations loaded");

    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%address, error = %e, "Failed to bind");
            ctx.shutdown().await;
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    match serve(ctx, listener, shutdown_signal()).await {
        Ok(()) => {
            info!("Gateway stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}
