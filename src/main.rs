use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use reservoir::config::Config;
use reservoir::saga::{
    ApproveAll, LocalGateway, PgGateway, ReservationGateway, SagaCoordinator,
};
use reservoir::tenant::TenantManager;
use reservoir::{observability, reaper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    if let Err(e) = observability::init(config.metrics_port) {
        tracing::error!("metrics exporter disabled: {e}");
    }

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let tenant_manager = Arc::new(TenantManager::new(
        config.data_dir.clone(),
        config.compact_threshold,
    ));
    let loaded = tenant_manager.load_existing()?;

    let gateway: Arc<dyn ReservationGateway> = match &config.remote {
        Some(endpoint) => {
            info!("  reservations: remote {}:{}", endpoint.host, endpoint.port);
            let attempts = config.saga.compensation_attempts;
            Arc::new(PgGateway::new(
                endpoint.clone(),
                PgGateway::attempt_timeout_within(config.saga.step_timeout, attempts, config.saga.backoff),
                attempts,
                config.saga.backoff,
            ))
        }
        None => Arc::new(LocalGateway::new(tenant_manager.clone())),
    };
    let coordinator = Arc::new(SagaCoordinator::new(
        gateway,
        Arc::new(ApproveAll),
        config.saga.clone(),
    ));
    tokio::spawn(reaper::run_saga_sweeper(
        tenant_manager.clone(),
        coordinator.clone(),
        config.saga_sweep_interval,
    ));

    let roles = config.role_map();
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("reservoir listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tenants loaded: {loaded}");
    info!("  max_connections: {max_connections}");
    info!("  admins: {}", config.admin_users.join(","));
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let saga = coordinator.clone();
                let roles = roles.clone();
                let pw = config.password.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, tm, saga, roles, pw).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("reservoir stopped");
    Ok(())
}
