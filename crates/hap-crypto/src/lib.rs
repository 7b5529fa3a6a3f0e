//! # hap-crypto
//!
//! Crypto primitives adapter for the HomeKit accessory protocol. Wraps
//! proven libraries; no novel crypto:
//! - SRP-6a (group rfc5054.3072, SHA-512) for pair-setup
//! - Ed25519 signatures for long-term identities
//! - X25519 ECDH for pair-verify
//! - HKDF-SHA512 for every key derivation
//! - ChaCha20-Poly1305 for pairing messages and the session stream
//! - TLV8 encoding of pairing payloads

pub mod chacha;
pub mod curve25519;
pub mod ed25519;
pub mod hkdf;
pub mod srp;
pub mod tlv;

pub use chacha::{nonce_from_label, open, seal, SessionCipher};
pub use curve25519::EcdhKeyPair;
pub use ed25519::DeviceKeyPair;
pub use srp::{SrpServer, SRP_SALT_LENGTH};
pub use tlv::{Tlv8, TlvType};
