use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "menaje_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "menaje_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "menaje_connections_active";
pub const CONNECTIONS_TOTAL: &str = "menaje_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "menaje_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "menaje_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "menaje_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "menaje_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "menaje_wal_compactions_total";

// ── Stock ledger ────────────────────────────────────────────────

/// Counter: saves or transitions refused for insufficient stock.
pub const OVERBOOKING_REJECTIONS_TOTAL: &str = "menaje_overbooking_rejections_total";

/// Counter: lock waits that expired or creation races that could not settle.
pub const CONCURRENCY_CONFLICTS_TOTAL: &str = "menaje_concurrency_conflicts_total";

/// Counter: availability computations that found more committed than stocked.
pub const NEGATIVE_AVAILABILITY_TOTAL: &str = "menaje_negative_availability_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectItems => "select_items",
        Command::SelectItem { .. } => "select_item",
        Command::UpsertItem { .. } => "upsert_item",
        Command::GetOrCreateReservation { .. } => "get_or_create_reservation",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectLines { .. } => "select_lines",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SaveLines { .. } => "save_lines",
        Command::ClearLines { .. } => "clear_lines",
        Command::SetEstado { .. } => "set_estado",
    }
}
