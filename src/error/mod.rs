//! Error handling for the ledger
//!
//! One error enum covers every fault domain of a node. The variants follow the
//! propagation policy: validation failures (`Linkage`, `ProofOfWork`,
//! `Signature`, `Validation`) reject a block or chain, `Protocol` closes one
//! connection, `Network` disconnects one peer and `Persistence` is fatal at
//! startup.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// The specific check a block failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Index or previous-hash does not follow the predecessor
    BadLinkage,
    /// Hash does not meet the target, or the difficulty is not the required one
    BadPoW,
    /// Block carries no page records
    EmptyBody,
    /// A record is unsigned, its content hash does not match its text, or the
    /// signature verifier rejected it
    BadSignature,
    /// The same title and page index is recorded twice
    DuplicatePage,
    /// The records root in the header does not match the body
    BadRecordsRoot,
    /// Timestamp earlier than the predecessor or too far in the future
    BadTimestamp,
    /// Block zero is not the fixed genesis block
    BadGenesis,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationErrorKind::BadLinkage => "bad linkage",
            ValidationErrorKind::BadPoW => "bad proof-of-work",
            ValidationErrorKind::EmptyBody => "empty body",
            ValidationErrorKind::BadSignature => "bad signature",
            ValidationErrorKind::DuplicatePage => "duplicate page",
            ValidationErrorKind::BadRecordsRoot => "bad records root",
            ValidationErrorKind::BadTimestamp => "bad timestamp",
            ValidationErrorKind::BadGenesis => "bad genesis",
        };
        f.write_str(name)
    }
}

/// A chain failed validation at a specific block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainValidationError {
    pub index: u64,
    pub kind: ValidationErrorKind,
}

impl fmt::Display for ChainValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}: {}", self.index, self.kind)
    }
}

/// Comprehensive error types for ledger operations
#[derive(Debug, Clone)]
pub enum LedgerError {
    /// Bad previous-hash or index
    Linkage(String),
    /// Hash does not meet the target
    ProofOfWork(String),
    /// Missing or invalid signature on a page record
    Signature(String),
    /// Any other block or chain validation failure
    Validation(ChainValidationError),
    /// Bad magic number, malformed frame, unknown message type, version mismatch
    Protocol(String),
    /// Connection reset, timeout, refused
    Network(String),
    /// Corrupt or unreadable chain file
    Persistence(String),
    /// Sled database errors
    Database(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// File I/O errors
    Io(String),
}

impl LedgerError {
    /// Protocol errors close the connection they occurred on.
    pub fn is_protocol(&self) -> bool {
        matches!(self, LedgerError::Protocol(_))
    }

    /// Errors raised by the block and chain checks.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::Linkage(_)
                | LedgerError::ProofOfWork(_)
                | LedgerError::Signature(_)
                | LedgerError::Validation(_)
        )
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Linkage(msg) => write!(f, "Linkage error: {msg}"),
            LedgerError::ProofOfWork(msg) => write!(f, "Proof-of-work error: {msg}"),
            LedgerError::Signature(msg) => write!(f, "Signature error: {msg}"),
            LedgerError::Validation(err) => write!(f, "Validation error at {err}"),
            LedgerError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            LedgerError::Network(msg) => write!(f, "Network error: {msg}"),
            LedgerError::Persistence(msg) => write!(f, "Persistence error: {msg}"),
            LedgerError::Database(msg) => write!(f, "Database error: {msg}"),
            LedgerError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            LedgerError::Config(msg) => write!(f, "Configuration error: {msg}"),
            LedgerError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            LedgerError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<ChainValidationError> for LedgerError {
    fn from(err: ChainValidationError) -> Self {
        match err.kind {
            ValidationErrorKind::BadLinkage => LedgerError::Linkage(err.to_string()),
            ValidationErrorKind::BadPoW => LedgerError::ProofOfWork(err.to_string()),
            ValidationErrorKind::BadSignature => LedgerError::Signature(err.to_string()),
            _ => LedgerError::Validation(err),
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Io(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for LedgerError {
    fn from(err: bincode::error::EncodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for LedgerError {
    fn from(err: bincode::error::DecodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}
