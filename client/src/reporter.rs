//! Per-request status lines.
//!
//! The dispatcher hands one [`Outcome`] per completed local call to a
//! [`StatusReporter`]; what happens with it is purely presentational.

use chrono::{DateTime, Local};

/// A single completed request/response pair
#[derive(Debug, Clone)]
pub struct Outcome {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub origin: Option<String>,
    pub latency_ms: u64,
}

pub trait StatusReporter: Send + Sync {
    fn report(&self, outcome: &Outcome);
}

/// Prints one line per request to stdout
pub struct ConsoleReporter;

impl StatusReporter for ConsoleReporter {
    fn report(&self, outcome: &Outcome) {
        println!("{}", format_line(outcome));
    }
}

fn format_line(outcome: &Outcome) -> String {
    format!(
        "{} [{}] {}  {}  > {}  ({}ms)",
        outcome.timestamp.format("%H:%M:%S"),
        outcome.origin.as_deref().unwrap_or("-"),
        outcome.status,
        outcome.method,
        outcome.path,
        outcome.latency_ms,
    )
}
