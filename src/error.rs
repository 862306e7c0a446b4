//! # Protocol Error Taxonomy
//!
//! Every per-message failure in the handshake, registry and ticket layers is
//! a [`ProtocolError`]. None of these are ever echoed across the wire: the
//! server maps every `Err` to "no reply sent" and leaves the peer to time out,
//! so an observer cannot tell an unknown username from a wrong password or a
//! replayed request.
//!
//! | Variant | Raised when | Server reaction |
//! |---------|-------------|-----------------|
//! | `Transport` | socket send/receive failed after retries | logged |
//! | `Decryption` | ciphertext malformed or tampered | silent drop |
//! | `PuzzleUnsolvable` | client exhausted the search domain | n/a (client) |
//! | `PuzzleRejected` | server got a wrong puzzle answer | record deleted, drop |
//! | `AuthenticationFailed` | confirmation hash mismatch | record deleted, drop |
//! | `UnknownUser` | no verifier for the username | silent drop |
//! | `ReplayDetected` | nonce seen before, or request outside the freshness window | silent drop |
//! | `NoSession` | sender or introduction target has no live session | silent drop |

use crate::crypto::CryptoError;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Sending or receiving a datagram failed.
    Transport(String),
    /// Symmetric or asymmetric decryption failed.
    Decryption,
    /// No candidate in the public search domain matched the puzzle digest.
    PuzzleUnsolvable,
    /// The submitted puzzle answer did not match the issued target.
    PuzzleRejected,
    /// The peer does not know the password (hash mismatch).
    AuthenticationFailed,
    /// No password verifier is registered for the username.
    UnknownUser,
    /// The nonce was already accepted on this channel, or the message is stale.
    ReplayDetected,
    /// A required session is not registered.
    NoSession,
    /// A bounded table is full of live entries.
    Capacity,
    /// The message arrived in a state that cannot accept it.
    UnexpectedState(&'static str),
    /// The message could not be decoded or carried out-of-range values.
    Malformed(&'static str),
    /// No datagram arrived before the receive deadline.
    Timeout,
    /// The operating system CSPRNG failed.
    Crypto(CryptoError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Transport(e) => write!(f, "transport error: {}", e),
            ProtocolError::Decryption => write!(f, "decryption failed"),
            ProtocolError::PuzzleUnsolvable => write!(f, "puzzle has no solution in the search domain"),
            ProtocolError::PuzzleRejected => write!(f, "puzzle answer rejected"),
            ProtocolError::AuthenticationFailed => write!(f, "invalid username or password"),
            ProtocolError::UnknownUser => write!(f, "unknown user"),
            ProtocolError::ReplayDetected => write!(f, "replayed or stale message"),
            ProtocolError::NoSession => write!(f, "no live session"),
            ProtocolError::Capacity => write!(f, "table at capacity"),
            ProtocolError::UnexpectedState(what) => write!(f, "unexpected state: {}", what),
            ProtocolError::Malformed(what) => write!(f, "malformed message: {}", what),
            ProtocolError::Timeout => write!(f, "timed out waiting for a datagram"),
            ProtocolError::Crypto(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CryptoError> for ProtocolError {
    fn from(err: CryptoError) -> Self {
        ProtocolError::Crypto(err)
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(_: bincode::Error) -> Self {
        ProtocolError::Malformed("undecodable payload")
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Transport(err.to_string())
    }
}
