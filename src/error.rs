//! Per-layer error types (spec §7).

use thiserror::Error;

/// Obfuscation / framing failures (C1, C5).
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("envelope shorter than the 21-byte minimum header")]
    TooShort,
    #[error("declared payload length {declared} exceeds remaining buffer of {available} bytes")]
    BadLength { declared: u32, available: usize },
    #[error("outer frame length prefix declared {declared} bytes, buffer only carries {available}")]
    IncompleteFrame { declared: u32, available: usize },
}

/// Symmetric / asymmetric crypto failures (C2, C3).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD authentication failed")]
    AuthFailed,
    #[error("ciphertext shorter than the 12-byte nonce")]
    CiphertextTooShort,
    #[error("RSA-OAEP unwrap failed")]
    KeyUnwrapFailed,
    #[error("RSA-OAEP wrap failed: {0}")]
    WrapFailed(String),
    #[error("padded plaintext shorter than its 4-byte length prefix")]
    PaddingTooShort,
    #[error("key material has the wrong length: expected {expected}, got {actual}")]
    BadKeyLength { expected: usize, actual: usize },
    #[error("PEM encode/decode error: {0}")]
    Pem(String),
}

/// Network I/O failures local to a single peer (C5).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("peer {0} is not connected")]
    PeerNotConnected(String),
    #[error("connect to {host}:{port} timed out")]
    DialTimeout { host: String, port: u16 },
}

/// Persistence failures (C4). Always surfaced to the caller, per spec §7.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to resolve or create the app data directory")]
    DataDir,
}

/// Identity/configuration failures (C10). Fatal to initialization.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("I/O error reading/writing identity state: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize identity record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("could not determine a writable identity directory")]
    NoDataDir,
}

/// Session-layer failures (C9). Decryption failures are recorded, never fatal.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("envelope is not a recognized message type")]
    NotAMessage,
    #[error("no session key established with peer {0}")]
    NoSession(String),
    #[error("invalid hex in envelope data field")]
    BadHex,
}

/// Aggregate failure while assembling a node's identity, keys and storage.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
