use thiserror::Error;

/// Everything that can go wrong while relaying a request.
///
/// None of these are fatal to the bridge: each one ends up as a reply on the
/// channel the request came from.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// A required field was missing, e.g. no payload for `set-workflow`.
    #[error("{0}")]
    MalformedRequest(String),

    /// The graph host or the execution service rejected a call.
    #[error("{0}")]
    Collaborator(String),

    /// The execution monitor ran out of time.
    #[error("timeout")]
    Timeout,

    /// Execution finished but its outputs could not be read back.
    #[error("output retrieval failed: {0}")]
    OutputRetrieval(String),

    /// The message could not be delivered because the other side went away.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Something went wrong encoding or decoding JSON.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> BridgeError {
        BridgeError::Json(err.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
