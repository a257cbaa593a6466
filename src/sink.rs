//! Output boundary for operator-facing log lines and progress events.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::progress::ProgressEvent;

/// Severity tag attached to every operator-facing log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
    Progress,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Success => "success",
            Severity::Progress => "progress",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives everything the flashing core wants an operator to see.
///
/// Implementations must not block; nothing they return is relied upon.
pub trait EventSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str);

    fn progress(&self, event: &ProgressEvent);
}

/// Default sink forwarding everything to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info | Severity::Success | Severity::Progress => {
                info!(severity = %severity, "{message}");
            }
            Severity::Warning => warn!(severity = %severity, "{message}"),
            Severity::Error => error!(severity = %severity, "{message}"),
        }
    }

    fn progress(&self, event: &ProgressEvent) {
        debug!(
            segment = event.segment_index,
            written = event.bytes_written,
            total = event.bytes_total,
            percent = event.percent,
            "Write progress"
        );
    }
}
