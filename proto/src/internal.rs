//! Internal error values shared between the server crates. These are not
//! returned over the wire directly, they are mapped into protocol errors at
//! the edges.

use serde::{Deserialize, Serialize};

/// An error in the server's own operation, as opposed to a protocol error
/// made by a client. Surfacing one of these to a user agent always becomes
/// `server_error` with no further detail.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum OperationError {
    Backend,
    CryptographyError,
    SerdeJsonError,
    InvalidRequestState,
    InvalidSessionState,
    InvalidEntryState,
    NoMatchingEntries,
    DuplicateKey,
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperationError::Backend => "backend failure",
            OperationError::CryptographyError => "cryptography error",
            OperationError::SerdeJsonError => "serde json error",
            OperationError::InvalidRequestState => "invalid request state",
            OperationError::InvalidSessionState => "invalid session state",
            OperationError::InvalidEntryState => "invalid entry state",
            OperationError::NoMatchingEntries => "no matching entries",
            OperationError::DuplicateKey => "duplicate key",
        })
    }
}
