//! fhirhook: shared FHIR rest-hook subscriptions for local consumers.
//!
//! # Usage
//!
//! ```bash
//! fhirhook --fhir-base-url http://localhost:8080/fhir \
//!     --callback-url http://bridge.local:8090/fhir-callback \
//!     --watch 'Patient?name=smith'
//! ```
//!
//! Environment variables can also be used:
//! - `FHIRHOOK_CALLBACK_URL`: Public webhook URL (service disabled if unset)
//! - `FHIRHOOK_FHIR_BASE_URL`: FHIR server base URL
//! - `FHIRHOOK_PORT`: Port to listen on
//! - `RUST_LOG`: Log filter (overrides `--log-level`)

use fhirhook::config::Config;
use fhirhook::observability::tracing::init_tracing;
use fhirhook::server::run_server;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
    __ _     _        _                 _
   / _| |__ (_)_ __  | |__   ___   ___ | | __
  | |_| '_ \| | '__| | '_ \ / _ \ / _ \| |/ /
  |  _| | | | | |    | | | | (_) | (_) |   <
  |_| |_| |_|_|_|    |_| |_|\___/ \___/|_|\_\

  fhirhook v{} - FHIR Subscription Bridge

  Configuration:
    Address:    {}:{}
    Callback:   {}
    FHIR:       {} ({:?})
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.host,
        config.port,
        config.callback_url.as_deref().unwrap_or("<disabled>"),
        config.fhir_base_url.as_deref().unwrap_or("<none>"),
        config.fhir_version,
        config.log_level
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    // Initialize tracing/logging
    init_tracing(&config.log_level, config.log_format);

    // Print startup banner
    print_banner(&config);

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn signal handler task
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {
                            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating shutdown...");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = ctrl_c.await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }

        // Signal shutdown
        let _ = shutdown_tx.send(true);
    });

    // Run the server
    run_server(config, shutdown_rx).await?;

    tracing::info!("fhirhook shutdown complete");
    Ok(())
}
