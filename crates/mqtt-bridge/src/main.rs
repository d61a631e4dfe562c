mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use event_bus::{EventForwarder, EventTransformer};
use ws_ingress::{AuthGate, Ingress, IngressConfig, SessionConfig};

use crate::cli::Cli;
use crate::config::ConfigSource;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI / environment overrides.
    let (mut cfg, source) = config::load(&cli.config)?;

    if let Some(ref name) = cli.application_name {
        cfg.bridge.application_name = name.clone();
    }
    if let Some(ref url) = cli.event_url {
        cfg.event_bus.url = url.clone();
    }
    if let Some(ref url) = cli.oauth_url {
        cfg.auth.oauth_url = Some(url.clone());
    }

    let mut settings = cfg.resolve().context("invalid configuration")?;
    if let Some(port) = cli.port {
        settings.listen_addr.set_port(port);
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    if source == ConfigSource::Defaults {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    info!(
        config_file = %cli.config.display(),
        application_name = %settings.application_name,
        listen = %settings.listen_addr,
        event_url = %settings.event_url,
        oauth_url = ?settings.oauth_url.as_ref().map(|url| url.as_str()),
        max_inflight = settings.max_inflight,
        "mqtt-bridge starting"
    );

    // 4. Event bus side.
    let forwarder = EventForwarder::new(settings.event_url.clone(), settings.event_timeout)
        .context("failed to build event bus client")?;
    info!(url = %forwarder.url(), timeout = ?settings.event_timeout, "event forwarder ready");
    let session = Arc::new(SessionConfig {
        transformer: EventTransformer::new(settings.application_name.clone()),
        sink: Arc::new(forwarder),
        max_packet_size: settings.max_packet_size,
        max_inflight: settings.max_inflight,
    });

    // 5. Upgrade auth.
    let auth = match &settings.oauth_url {
        Some(authority) => {
            let gate = AuthGate::introspecting(authority, settings.auth_timeout)
                .context("failed to configure token validation")?;
            if let Some(url) = gate.validate_url() {
                info!(validate_url = %url, "token validation enabled");
            }
            gate
        }
        None => AuthGate::disabled(),
    };

    // 6. Serve until SIGINT / SIGTERM.
    let ingress = Ingress::new(IngressConfig {
        listen_addr: settings.listen_addr,
        auth,
        session,
    });
    ingress.run(shutdown_signal()).await?;

    info!("mqtt-bridge shutting down");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler; only ctrl-c will stop the bridge");
                wait_for_ctrl_c(ctrl_c).await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        wait_for_ctrl_c(ctrl_c).await;
    }
}

async fn wait_for_ctrl_c(ctrl_c: impl std::future::Future<Output = std::io::Result<()>>) {
    match ctrl_c.await {
        Ok(()) => info!("received SIGINT (ctrl-c)"),
        Err(err) => {
            // Never shut down on a listener failure.
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
