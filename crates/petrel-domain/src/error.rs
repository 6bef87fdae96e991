use thiserror::Error;

/// Error taxonomy of the data-model core.
///
/// The first four variants correspond one-to-one to the CoAP-equivalent
/// codes that LwM2M-facing operations report; the remaining ones surface
/// from the persistence layer.
#[derive(Debug, Error)]
pub enum DmError {
    /// Malformed input, attribute constraint violation, invalid SSID or
    /// access mask.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing instance, resource or ACL entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected by a state machine or by the capability set of the target.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Allocation failure, a host callback stepping outside its contract, or
    /// an encoding error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Persisted stream with bad magic, failed sanity check or truncated
    /// payload.
    #[error("malformed persisted data: {0}")]
    BadMessage(String),

    /// Unknown persistence format version.
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DmError {
    /// Maps a read-side I/O failure: truncation is a malformed stream, not
    /// an internal error.
    pub fn from_read_error(err: std::io::Error) -> DmError {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            DmError::BadMessage("unexpected end of stream".to_string())
        } else {
            DmError::Io(err)
        }
    }
}
