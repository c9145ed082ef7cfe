//! Logging utility functions for connector events

use crate::models::{Destination, ExchangeLog};
use crate::{log_connector_exchange, log_debug, log_trace, log_warning};
use tracing::info;

/// Log a successfully opened connection
pub fn log_connection_opened(id: u64, destination: &Destination, secure: bool, connect_time: u64) {
    info!(
        "🔌 Connection #{} opened to {}{} ({}ms)",
        id,
        destination,
        if secure { " over TLS" } else { "" },
        connect_time
    );
}

/// Log a failed connection attempt
pub fn log_connection_failure(id: u64, destination: &Destination, connect_time: u64, error: &str) {
    log_debug!(
        "❌ Connection #{} to {} failed ({}ms): {}",
        id,
        destination,
        connect_time,
        error
    );
}

/// Log a connection leaving the pool
pub fn log_connection_closed(id: u64, destination: &Destination, failed_calls: usize, reason: &str) {
    if failed_calls > 0 {
        log_warning!(
            "Connection #{} to {} closed ({}), failing {} pending call(s)",
            id,
            destination,
            reason,
            failed_calls
        );
    } else {
        log_debug!("Connection #{} to {} closed ({})", id, destination, reason);
    }
}

/// Log a request rejected because the pool bounds were reached
pub fn log_capacity_exhausted(destination: &Destination, total: usize, for_destination: usize) {
    log_warning!(
        "Unable to find a connection to send the request to {} ({} open, {} for this destination)",
        destination,
        total,
        for_destination
    );
}

/// Log bytes handed to the socket
pub fn log_message_written(connection_id: u64, call_id: u64, len: usize) {
    log_trace!("Connection #{} wrote call {} ({} bytes)", connection_id, call_id, len);
}

/// Log a finished exchange as one structured line
pub fn log_exchange_completed(entry: &ExchangeLog) {
    log_connector_exchange!(entry);
}
