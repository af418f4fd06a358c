//! Webhook server setup and lifecycle.
//!
//! Configures axum with:
//! - Callback routes in front of the notification router
//! - Optional Prometheus endpoint on a separate port
//! - Orphan purge at startup and shutdown
//! - Graceful shutdown support

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use axum::Router;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::backend::{FhirRestBackend, InMemoryBackend, SubscriptionBackend};
use crate::config::Config;
use crate::flow::{Callback, ChannelListener, EventBus};
use crate::observability::metrics::{init_metrics, prometheus_registry};
use crate::observability::prometheus::{run_prometheus_server, PrometheusState};
use crate::service::{webhook, NotificationRouter, SubscriptionRegistry, SubscriptionWrapper};

/// Build the webhook application.
pub fn create_app(router: Arc<NotificationRouter>, webhook_path: &str) -> Router {
    webhook::routes(webhook_path)
        .layer(TraceLayer::new_for_http())
        .with_state(router)
}

/// Build the subscription backend selected by the configuration.
///
/// A disabled service never calls its backend, so it gets an in-memory one.
pub fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn SubscriptionBackend>> {
    match &config.fhir_base_url {
        Some(base_url) => {
            let backend =
                FhirRestBackend::new(base_url, config.fhir_version, config.backend_timeout())
                    .context("failed to build FHIR client")?;
            Ok(Arc::new(backend))
        }
        None if config
            .callback_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty()) =>
        {
            bail!("--fhir-base-url is required when --callback-url is set")
        }
        None => Ok(Arc::new(InMemoryBackend::new())),
    }
}

/// Subscribe to every `--watch` criteria and log what arrives.
///
/// Watchers are pushed as they start, so the ones started before a failure
/// stay in `watchers` for release.
async fn start_watchers(
    config: &Config,
    registry: &Arc<SubscriptionRegistry>,
    shutdown_rx: &watch::Receiver<bool>,
    watchers: &mut Vec<(Arc<SubscriptionWrapper>, Callback)>,
) -> anyhow::Result<()> {
    for criteria in &config.watch {
        let (listener, mut events) = ChannelListener::new(config.notify_channel_size);
        let Some(wrapper) = registry
            .subscribe(criteria, Some(config.watch_payload), listener.clone())
            .await
            .with_context(|| format!("failed to watch {criteria}"))?
        else {
            tracing::warn!(criteria = %criteria, "Service disabled, not watching");
            continue;
        };

        tracing::info!(
            criteria = %criteria,
            subscription_id = %wrapper.subscription_id(),
            "Watching"
        );

        let mut shutdown = shutdown_rx.clone();
        let criteria = criteria.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(event) => tracing::info!(
                            criteria = %criteria,
                            subscription_id = %event.subscription_id,
                            resource_type = event.resource.as_ref().map(|r| r.resource_type.as_str()),
                            resource_id = event.resource.as_ref().and_then(|r| r.id.as_deref()),
                            "Resource notification"
                        ),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        watchers.push((wrapper, listener));
    }

    Ok(())
}

/// Release the watched subscriptions and purge everything tagged for this
/// callback base.
async fn release_and_purge(
    registry: &SubscriptionRegistry,
    watchers: Vec<(Arc<SubscriptionWrapper>, Callback)>,
) {
    if let Err(e) = registry.unsubscribe_all(watchers).await {
        tracing::warn!(error = %e, "Failed to release watched subscriptions");
    }
    registry.destroy().await;
}

/// Start the watchers and serve the webhook until shutdown.
async fn serve(
    config: &Config,
    addr: SocketAddr,
    router: Arc<NotificationRouter>,
    shutdown_rx: &watch::Receiver<bool>,
    watchers: &mut Vec<(Arc<SubscriptionWrapper>, Callback)>,
) -> anyhow::Result<()> {
    let registry = router.registry().clone();
    start_watchers(config, &registry, shutdown_rx, watchers).await?;

    let app = create_app(router, &config.webhook_path);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        address = %addr,
        webhook_path = %config.webhook_path,
        disabled = registry.is_disabled(),
        "Starting fhirhook webhook server"
    );

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
            tracing::info!("Shutdown signal received, stopping server");
        })
        .await?;

    Ok(())
}

/// Run the webhook service on an existing registry.
///
/// Watched subscriptions are released and tagged subscriptions purged
/// whether serving ends normally or with an error.
pub async fn run_with_registry(
    config: &Config,
    registry: Arc<SubscriptionRegistry>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let metrics_addr: SocketAddr = format!("{}:{}", config.host, config.metrics_port).parse()?;

    if config.purge_on_start {
        registry.destroy().await;
    }

    let router = Arc::new(NotificationRouter::new(
        registry.clone(),
        config.decode_failure_policy,
    ));

    if config.metrics_enabled {
        init_metrics();
        let state = PrometheusState::new(prometheus_registry(), router.clone());
        let metrics_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_server(metrics_addr, state, metrics_shutdown).await {
                tracing::error!(error = %e, "Prometheus server failed");
            }
        });
    }

    let mut watchers = Vec::new();
    let result = serve(config, addr, router, &shutdown_rx, &mut watchers).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Server failed, releasing subscriptions");
    }

    release_and_purge(&registry, watchers).await;

    tracing::info!("Server stopped");
    result
}

/// Run the fhirhook server.
///
/// # Arguments
///
/// * `config` - Server configuration
/// * `shutdown_rx` - Receiver for shutdown signal
///
/// # Returns
///
/// Returns when the server has shut down.
pub async fn run_server(config: Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let backend = build_backend(&config)?;
    let registry = Arc::new(SubscriptionRegistry::new(
        config.registry_config(),
        backend,
        Arc::new(EventBus::new()),
    ));

    run_with_registry(&config, registry, shutdown_rx).await
}
