//! Control plane HTTP server.

use std::net::SocketAddr;
use std::time::Duration;

use fogplane_telemetry::events;
use tokio::net::TcpListener;

use crate::api::create_router;
use crate::services::Services;

/// How often microservices marked for deletion are swept (seconds).
const DELETION_SWEEP_INTERVAL_SECS: u64 = 60;

/// Server configuration.
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub services: Services,
}

/// Run the control plane server.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let sweep_services = config.services.clone();
    tokio::spawn(async move {
        run_deletion_sweep(sweep_services).await;
    });

    let app = create_router(config.services);

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        event = events::LISTENING,
        addr = %config.listen_addr,
        "control plane listening"
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically hard-deletes microservices that were marked for deletion and
/// whose agent no longer reports them running. Catches agents that stop
/// reporting status before the final report arrives.
async fn run_deletion_sweep(services: Services) {
    let mut interval = tokio::time::interval(Duration::from_secs(DELETION_SWEEP_INTERVAL_SECS));
    interval.tick().await; // skip immediate first tick

    loop {
        interval.tick().await;
        let fogs = match services.agents().list().await {
            Ok(fogs) => fogs,
            Err(e) => {
                tracing::error!(error = %e, "failed to list agents for deletion sweep");
                continue;
            }
        };
        for fog in fogs {
            match services.microservices().delete_not_running(fog.uuid).await {
                Ok(removed) if removed.is_empty() => {}
                Ok(removed) => {
                    tracing::info!(
                        fog_uuid = %fog.uuid,
                        count = removed.len(),
                        "swept deleted microservices"
                    );
                }
                Err(e) => {
                    tracing::error!(fog_uuid = %fog.uuid, error = %e, "deletion sweep failed");
                }
            }
        }
    }
}
