#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use webssh_bridge::bridge::demo::DemoServer;
use webssh_bridge::bridge::{BridgeConfig, BridgeState, build_app};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let config = Arc::new(BridgeConfig::from_env());
    let shutdown = CancellationToken::new();

    // Optional demo SSH server next to the bridge
    if config.demo_server_enabled {
        match DemoServer::from_config(&config) {
            Ok(server) => {
                let cancel = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = server.run(cancel).await {
                        error!("Demo SSH server failed: {}", e);
                    }
                });
            }
            Err(e) => warn!("Demo SSH server not started: {}", e),
        }
    }

    let state = Arc::new(BridgeState::new(Arc::clone(&config)));
    let registry = Arc::clone(&state.registry);
    let app = build_app(state);

    info!(
        "Starting WebSocket SSH bridge on {} (shell role: {:?})",
        config.listen_addr, config.shell_role
    );

    let signal_registry = Arc::clone(&registry);
    let signal_shutdown = shutdown.clone();
    Server::new(TcpListener::bind(config.listen_addr.clone()))
        .name("WebSocket SSH Bridge")
        .run_with_graceful_shutdown(
            app,
            async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!(
                    "Shutting down, closing {} connection(s)",
                    signal_registry.len()
                );
                for connection in signal_registry.list() {
                    info!(
                        connection_id = %connection.connection_id,
                        peer = ?connection.peer,
                        "Closing connection in {} (open since {})",
                        connection.state, connection.started_at
                    );
                }
                signal_registry.cancel_all();
                signal_shutdown.cancel();
            },
            Some(Duration::from_secs(5)),
        )
        .await?;

    registry.cancel_all();
    shutdown.cancel();
    info!("WebSocket SSH bridge stopped");

    Ok(())
}
