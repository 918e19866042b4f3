//! Error taxonomy shared across the workspace. Follows the teacher's
//! `vaultbackup-rs::ProgramError` shape: a plain enum with a manual
//! `Display` and `std::error::Error` impl, used for errors a caller branches
//! on. Binaries layer `anyhow` on top at the CLI boundary.

use std::fmt;

/// Errors raised while decoding or dispatching an event bus message.
/// Per spec.md §7 "Protocol" errors: logged and dropped, never a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    Malformed(String),
    UnknownEventKind(String),
    MissingField { event: String, field: String },
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonError::Malformed(detail) => write!(f, "malformed event: {detail}"),
            CommonError::UnknownEventKind(kind) => write!(f, "unknown event kind: {kind}"),
            CommonError::MissingField { event, field } => {
                write!(f, "event {event} missing required field {field}")
            }
        }
    }
}

impl std::error::Error for CommonError {}
