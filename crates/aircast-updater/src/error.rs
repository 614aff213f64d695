//! Error types for the update pipeline.
//!
//! Each stage of a check cycle has its own error enum so the surfaced error
//! is specific enough to render a distinct message. [`UpdateError`] is the
//! cycle-level error carried by the abort notification.

use thiserror::Error;

/// Errors reported by the transport collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish a connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// Request or read timed out
    #[error("request timed out")]
    Timeout,

    /// TLS certificate validation failed
    #[error("certificate validation failed: {0}")]
    Certificate(String),

    /// Server answered with a non-success HTTP status
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    /// Response body was interrupted mid-transfer
    #[error("response body interrupted: {0}")]
    Body(String),

    /// Request could not be built (bad URL, bad header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Response body exceeded the configured size limit
    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    ///
    /// Connection failures, timeouts, interrupted bodies, 5xx responses,
    /// 408 and 429 are transient. Every other 4xx status, certificate
    /// failures, malformed requests and oversized bodies are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout | Self::Body(_) => true,
            Self::Status { status } => *status >= 500 || *status == 408 || *status == 429,
            Self::Certificate(_) | Self::InvalidRequest(_) | Self::TooLarge { .. } => false,
        }
    }
}

/// Errors produced while parsing a feed document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The document is not well-formed; the whole feed is rejected
    #[error("malformed feed document: {0}")]
    Malformed(String),

    /// A single entry was unusable and dropped
    #[error("incomplete feed entry at index {index}: {reason}")]
    IncompleteEntry { index: usize, reason: String },
}

/// Errors produced by candidate selection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// The candidate-override hook returned an entry that does not pass the
    /// version or host filters
    #[error("override candidate {version} is not a valid update: {reason}")]
    NoValidCandidate { version: String, reason: String },
}

/// Errors produced while downloading a payload.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Final byte count differs from the declared length
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Non-transient HTTP status (4xx class)
    #[error("download failed with status {status}")]
    HttpStatus { status: u16 },

    /// TLS certificate validation failed
    #[error("certificate validation failed: {0}")]
    Certificate(String),

    /// Transient failures persisted past the attempt ceiling
    #[error("download failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    /// Any other terminal transport failure
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// URL is not HTTPS and insecure downloads are not allowed
    #[error("refusing insecure download URL: {0}")]
    InsecureUrl(String),

    /// The cycle was cancelled while downloading
    #[error("download cancelled")]
    Cancelled,

    /// Local file error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while verifying a payload.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// Signature algorithm tag is not in the accepted set
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Variant carries no signature and unsigned updates are not permitted
    #[error("payload is unsigned and unsigned updates are not permitted")]
    MissingSignature,

    /// Signature bytes could not be decoded for the tagged algorithm
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// No trusted public key is configured
    #[error("no trusted public keys configured")]
    NoTrustedKeys,

    /// No trusted key verifies the signature
    #[error("signature does not verify against any trusted key")]
    InvalidSignature,

    /// Payload digest differs from the declared content hash
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Payload could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while decrypting a verified payload.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// Payload requires a password and none was supplied
    #[error("encrypted payload requires a decryption password")]
    PasswordUnavailable,

    /// Container header is truncated or has the wrong magic
    #[error("malformed encrypted container: {0}")]
    Malformed(String),

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Authentication tag did not verify (wrong password or corrupted data)
    #[error("decryption failed: authentication tag mismatch")]
    AuthenticationFailed,

    /// Encryption failed while sealing a container
    #[error("encryption failed")]
    EncryptionFailed,

    /// Local file error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cycle-level errors surfaced through the abort notification.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A check request arrived while a cycle is active
    #[error("an update check is already in progress")]
    AlreadyInProgress,

    /// Feed could not be fetched
    #[error("feed fetch failed: {0}")]
    Transport(#[from] TransportError),

    /// Feed could not be parsed
    #[error("feed parse failed: {0}")]
    Parse(#[from] ParseError),

    /// Payload download failed
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Payload verification failed
    #[error("payload verification failed: {0}")]
    Verification(#[from] VerificationError),

    /// Payload decryption failed
    #[error("payload decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    /// Candidate is not newer than the running version under the standard comparator
    #[error("refusing to install {offered}: not newer than running version {current}")]
    DowngradeRejected { current: String, offered: String },

    /// Installer collaborator rejected the handoff
    #[error("installer handoff failed: {0}")]
    Handoff(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The cycle task stopped without reporting an outcome
    #[error("update cycle ended without reporting an outcome")]
    Interrupted,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Connect("reset".into()).is_transient());
        assert!(TransportError::Body("eof".into()).is_transient());
        assert!(TransportError::Status { status: 503 }.is_transient());
        assert!(TransportError::Status { status: 429 }.is_transient());
        assert!(TransportError::Status { status: 408 }.is_transient());

        assert!(!TransportError::Status { status: 404 }.is_transient());
        assert!(!TransportError::Status { status: 403 }.is_transient());
        assert!(!TransportError::Certificate("unknown issuer".into()).is_transient());
        assert!(!TransportError::InvalidRequest("bad url".into()).is_transient());
    }

    #[test]
    fn test_update_error_messages_are_distinct() {
        let download: UpdateError = DownloadError::LengthMismatch {
            expected: 10,
            actual: 9,
        }
        .into();
        let verify: UpdateError = VerificationError::InvalidSignature.into();
        assert_ne!(download.to_string(), verify.to_string());
        assert!(download.to_string().contains("length mismatch"));
        assert!(verify.to_string().contains("signature"));
    }
}
