//! uascd — OPC UA secure conversation echo daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use uasc_channel::{ChannelLimits, ChannelManager, ManagerOptions, Role};
use uasc_core::config::UascConfig;

mod connection;
mod transport;

use connection::Connection;
use transport::SocketTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = UascConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = UascConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        UascConfig::default()
    });
    config.validate().context("invalid configuration")?;

    let policy = config.security_policy()?;
    let mode = config.security_mode()?;
    if !policy.is_none() {
        // Certificates and RSA live outside this workspace.
        anyhow::bail!("uascd has no certificate provider; configure security policy None");
    }

    let limits = ChannelLimits::from(&config.limits);
    let transport = SocketTransport::new();
    let manager = Arc::new(ChannelManager::new(
        ManagerOptions::new(Role::Server)
            .with_limits(limits)
            .with_requested_lifetime(Duration::from_millis(u64::from(config.security.requested_lifetime_ms))),
        Arc::new(transport.clone()),
    ));

    let listener = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    tracing::info!(
        addr = %config.network.listen_addr,
        %policy,
        %mode,
        send_buffer = limits.send_buffer_size,
        receive_buffer = limits.receive_buffer_size,
        "uascd listening"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mut connections = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        continue;
                    }
                };
                let connection = Connection::new(
                    manager.clone(),
                    transport.clone(),
                    policy,
                    mode,
                    stream,
                    peer,
                    shutdown_tx.subscribe(),
                );
                connections.spawn(async move {
                    if let Err(e) = connection.run().await {
                        tracing::error!(%peer, error = %e, "connection failed");
                    }
                });
            }
        }
    }

    tracing::info!(
        channels = manager.channel_count(),
        connections = transport.connection_count(),
        "waiting for connections to close"
    );
    while connections.join_next().await.is_some() {}
    tracing::info!("uascd stopped");
    Ok(())
}
