//! Error types for the HomeKit accessory server.

use thiserror::Error;

/// Primary error type for all accessory operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Characteristic {aid}.{iid} not found")]
    CharacteristicNotFound { aid: u64, iid: u64 },
}

/// Errors during pair-setup, pair-verify and pairings administration.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Accessory is already paired")]
    AlreadyPaired,

    #[error("Another controller is pairing")]
    Busy,

    #[error("SRP client proof is invalid")]
    InvalidClientProof,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Unknown pairing method: {0}")]
    UnknownMethod(u8),

    #[error("MFi authentication is not supported")]
    MfiNotSupported,

    #[error("Unexpected pairing state: {0}")]
    UnexpectedState(u8),

    #[error("No session for {0}")]
    NoSession(String),

    #[error("No pairing named {0}")]
    UnknownPairing(String),

    #[error("Operation not allowed for non-admin controllers")]
    NotAdmin,

    #[error("Missing TLV field: {0}")]
    MissingTlv(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Parsing errors for TLV8, HTTP and JSON payloads.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Persistent store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// TLV8 error codes carried in the `Error` (0x07) record of pairing replies.
pub mod tlv_error {
    pub const UNKNOWN: u8 = 0x01;
    pub const AUTHENTICATION: u8 = 0x02;
    /// The protocol reports malformed requests with the same byte as
    /// authentication failures.
    pub const INVALID_REQUEST: u8 = 0x02;
    pub const BACKOFF: u8 = 0x03;
    pub const MAX_PEERS: u8 = 0x04;
    pub const MAX_TRIES: u8 = 0x05;
    pub const UNAVAILABLE: u8 = 0x06;
    pub const BUSY: u8 = 0x07;
}

/// Status codes used by the characteristic JSON protocol.
pub mod json_status {
    pub const OK: i32 = 0;
    pub const INSUFFICIENT_PRIVILEGES: i32 = -70401;
    pub const SERVICE_COMMUNICATION_FAILURE: i32 = -70402;
    pub const NOTIFICATION_NOT_SUPPORTED: i32 = -70406;
    pub const INVALID_VALUE_IN_REQUEST: i32 = -70410;
}
