use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Scheduling outcomes ─────────────────────────────────────────

/// Counter: slot listings served.
pub const SLOT_QUERIES_TOTAL: &str = "slotbook_slot_queries_total";

/// Counter: appointments admitted.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "slotbook_bookings_admitted_total";

/// Counter: bookings and reschedules refused for overlap, pre-check or race.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotbook_booking_conflicts_total";

// ── Resource utilization ────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDoctor { .. } => "insert_doctor",
        Command::SelectDoctors { .. } => "select_doctors",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectSlots { .. } => "select_slots",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn labels_are_snake_case() {
        let cmds = [
            Command::DeleteAppointment { id: Ulid::new() },
            Command::SelectDoctors { id: None },
        ];
        for cmd in &cmds {
            let label = command_label(cmd);
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{label}");
        }
    }

    #[test]
    fn no_port_is_noop() {
        assert!(init(None).is_ok());
    }
}
