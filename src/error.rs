use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to establish the broker link.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker connect did not complete within {0:?}")]
    Timeout(Duration),

    #[error("broker rejected the connection")]
    Refused,

    #[error("could not read credential file {path}: {source}")]
    Credentials {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failure of the outbound command call. Never escapes the dispatcher as a
/// panic; the verifier only ever sees it as a step outcome.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("publish call failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("publish endpoint rejected command (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Malformed telemetry payload. Logged and dropped at the delivery task;
/// a waiting caller just keeps waiting.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
}
