use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservoir_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservoir_query_duration_seconds";

/// Counter: reserve/hold attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "reservoir_reservations_total";

/// Histogram: reserve/hold latency in seconds, including the WAL append.
pub const RESERVE_DURATION_SECONDS: &str = "reservoir_reserve_duration_seconds";

// ── Saga metrics ────────────────────────────────────────────────

/// Counter: checkouts run to a terminal state. Labels: outcome.
pub const SAGAS_TOTAL: &str = "reservoir_sagas_total";

/// Histogram: checkout latency in seconds.
pub const SAGA_DURATION_SECONDS: &str = "reservoir_saga_duration_seconds";

/// Counter: saga steps successfully compensated.
pub const COMPENSATIONS_TOTAL: &str = "reservoir_compensations_total";

/// Counter: compensation steps that exhausted their retries. Alert on any
/// increase: capacity may be held by a FAILED order.
pub const COMPENSATION_UNRESOLVED_TOTAL: &str = "reservoir_compensation_unresolved_total";

/// Counter: orders finalized by the recovery sweeper.
pub const SAGAS_RECOVERED_TOTAL: &str = "reservoir_sagas_recovered_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservoir_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservoir_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservoir_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "reservoir_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservoir_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservoir_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Outcome label for a rejected reserve.
pub fn error_outcome(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) | EngineError::CapacityExceeded(_) => "conflict",
        EngineError::IntentVoided(_) | EngineError::AlreadyExists(_) => "duplicate",
        EngineError::NotFound(_) => "not_found",
        EngineError::Invalid(_) | EngineError::LimitExceeded(_) => "invalid",
        EngineError::Forbidden(_) => "forbidden",
        _ => "error",
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::InsertHold { .. } => "insert_hold",
        Command::ConfirmHold { .. } => "confirm_hold",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::InsertOrder { .. } => "insert_order",
        Command::SelectResources => "select_resources",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectOrder { .. } => "select_order",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectRemaining { .. } => "select_remaining",
    }
}
