//! Failure types raised while talking to a device, and the classifier that
//! turns them into an actionable [`Diagnosis`].
//!
//! Collaborators raise [`BootloaderError`], the segment loader raises
//! [`LoadError`], and every public orchestration operation returns
//! [`FlashError`]. [`classify`] is the only place that decides which
//! [`ErrorKind`] and remediation hint a failure maps to; it dispatches on
//! variants and never inspects message text.

use std::fmt;

use thiserror::Error;

use crate::connection::ConnectionState;

const SERIAL_PORT_HINT: &str =
    "Close the Arduino IDE or any serial monitor that may be holding the port, then try again";
const FIRMWARE_FILES_HINT: &str =
    "Check that the firmware .bin files listed in the manifest exist at their source paths";
const NETWORK_HINT: &str = "Check your network connection to the firmware host";
const RESEAT_HINT: &str = "Unplug the device, plug it back in and try again";
const NOT_CONNECTED_HINT: &str = "Connect to the device first";
const BUSY_HINT: &str = "Wait for the running operation to finish";

/// Failure raised by a transport or bootloader collaborator.
#[derive(Debug, Error)]
pub enum BootloaderError {
    /// The serial link could not be opened.
    #[error("Failed to open serial link: {0}")]
    Open(String),
    /// The bootloader did not answer the sync/identification sequence.
    #[error("Bootloader handshake failed: {0}")]
    Handshake(String),
    /// The device stopped answering within the collaborator's deadline.
    #[error("Timed out waiting for the device: {0}")]
    Timeout(String),
    /// The link went away while a command was in flight.
    #[error("Device link lost: {0}")]
    LinkLost(String),
    /// The bootloader rejected a flash command.
    #[error("Flash command rejected: {0}")]
    Write(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Anything the collaborator could not characterise further.
    #[error("{0}")]
    Other(String),
}

/// Failure raised while materialising a segment's bytes.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Segment not found: {path}")]
    NotFound { path: String },
    #[error("HTTP {status}: {path}")]
    Status { path: String, status: u16 },
    #[error("Segment source is empty: {path}")]
    Empty { path: String },
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to fetch {path}: {source}")]
    Network {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Invalid segment source {path}: {reason}")]
    InvalidSource { path: String, reason: String },
}

/// Error returned by every public connection and flashing operation.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Invalid firmware selection: {0}")]
    InvalidSelection(String),
    #[error("Device is not connected")]
    NotConnected,
    #[error("Device is already connected")]
    AlreadyConnected,
    #[error("Session is busy ({state})")]
    Busy { state: ConnectionState },
    /// The session was torn down before the operation reached the device.
    #[error("Device session was closed before the operation could run")]
    SessionClosed,
    #[error("Erase was not confirmed")]
    Cancelled,
    #[error("Connection failed: {0}")]
    Transport(#[source] BootloaderError),
    #[error("Chip detection failed: {0}")]
    Handshake(#[source] BootloaderError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("Flash write failed: {0}")]
    Write(#[source] BootloaderError),
    #[error("Flash erase failed: {0}")]
    Erase(#[source] BootloaderError),
}

impl FlashError {
    /// Shorthand for `classify(self).kind`.
    pub fn kind(&self) -> ErrorKind {
        classify(self).kind
    }
}

/// Failure taxonomy surfaced to operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransportUnavailable,
    HandshakeFailed,
    SegmentUnavailable,
    ProtocolWriteFailed,
    InvalidSelection,
    UserCancelled,
    Unknown,
}

impl ErrorKind {
    /// Stable snake_case label, used for metrics and machine-readable output.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransportUnavailable => "transport_unavailable",
            ErrorKind::HandshakeFailed => "handshake_failed",
            ErrorKind::SegmentUnavailable => "segment_unavailable",
            ErrorKind::ProtocolWriteFailed => "protocol_write_failed",
            ErrorKind::InvalidSelection => "invalid_selection",
            ErrorKind::UserCancelled => "user_cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure: what went wrong, and what the operator can do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnosis {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: Option<&'static str>,
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(hint) = self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

/// Maps a failure onto the [`ErrorKind`] taxonomy and picks its remediation hint.
pub fn classify(error: &FlashError) -> Diagnosis {
    let (kind, hint) = match error {
        FlashError::InvalidSelection(_) => (ErrorKind::InvalidSelection, None),
        FlashError::NotConnected => (ErrorKind::InvalidSelection, Some(NOT_CONNECTED_HINT)),
        FlashError::AlreadyConnected => (ErrorKind::InvalidSelection, None),
        FlashError::Busy { .. } => (ErrorKind::InvalidSelection, Some(BUSY_HINT)),
        FlashError::SessionClosed => (ErrorKind::InvalidSelection, Some(NOT_CONNECTED_HINT)),
        FlashError::Cancelled => (ErrorKind::UserCancelled, None),
        FlashError::Transport(cause) => match cause {
            BootloaderError::Other(_) => (ErrorKind::Unknown, None),
            BootloaderError::Handshake(_) => (ErrorKind::HandshakeFailed, Some(SERIAL_PORT_HINT)),
            _ => (ErrorKind::TransportUnavailable, Some(SERIAL_PORT_HINT)),
        },
        FlashError::Handshake(cause) => match cause {
            BootloaderError::Other(_) => (ErrorKind::Unknown, None),
            BootloaderError::Open(_) | BootloaderError::LinkLost(_) | BootloaderError::Io(_) => {
                (ErrorKind::TransportUnavailable, Some(SERIAL_PORT_HINT))
            }
            _ => (ErrorKind::HandshakeFailed, Some(SERIAL_PORT_HINT)),
        },
        FlashError::Load(cause) => match cause {
            LoadError::Network { .. } => (ErrorKind::TransportUnavailable, Some(NETWORK_HINT)),
            _ => (ErrorKind::SegmentUnavailable, Some(FIRMWARE_FILES_HINT)),
        },
        FlashError::Write(cause) | FlashError::Erase(cause) => match cause {
            BootloaderError::Other(_) => (ErrorKind::Unknown, None),
            BootloaderError::Open(_) | BootloaderError::LinkLost(_) | BootloaderError::Io(_) => {
                (ErrorKind::TransportUnavailable, Some(RESEAT_HINT))
            }
            _ => (ErrorKind::ProtocolWriteFailed, Some(RESEAT_HINT)),
        },
    };

    Diagnosis {
        kind,
        message: error.to_string(),
        hint,
    }
}
