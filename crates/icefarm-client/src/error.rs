//! Client-visible error taxonomy (spec.md §7): "the client surfaces only
//! terminal conditions to the caller." Transient transport failures are
//! logged by the call site and folded into one of these variants rather than
//! propagated as raw transport errors.

use std::fmt;

#[derive(Debug)]
pub enum ClientError {
    /// HTTP call to control failed outright (connection refused, timeout).
    Transport(String),
    /// Control replied with a non-2xx status.
    Server { status: u16, body: String },
    /// A response body did not match the expected shape.
    Malformed(String),
    /// `reserve` returned fewer devices than requested and the caller did
    /// not opt into waiting (spec.md §7 "Capacity").
    Capacity { requested: usize, available: usize },
    /// `available_timeout` elapsed while waiting for more devices to free up.
    AvailabilityTimeout,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(detail) => write!(f, "transport error: {detail}"),
            ClientError::Server { status, body } => write!(f, "control returned {status}: {body}"),
            ClientError::Malformed(detail) => write!(f, "malformed response: {detail}"),
            ClientError::Capacity { requested, available } => {
                write!(f, "requested {requested} devices, only {available} available")
            }
            ClientError::AvailabilityTimeout => write!(f, "timed out waiting for devices to become available"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ureq::Error> for ClientError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => {
                let body = response.into_string().unwrap_or_default();
                ClientError::Server { status, body }
            }
            ureq::Error::Transport(t) => ClientError::Transport(t.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Malformed(err.to_string())
    }
}
