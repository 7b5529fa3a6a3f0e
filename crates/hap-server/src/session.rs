//! Established session: per-connection symmetric keys over one pairing.

use hap_core::error::Result;
use hap_core::store::Pairing;
use hap_crypto::chacha::SessionCipher;
use hap_crypto::hkdf;

/// Symmetric session state installed after a successful pair-verify.
///
/// The accessory encrypts with the Control-Read key and decrypts with the
/// Control-Write key; the controller holds the mirror arrangement. Counters
/// live inside the cipher and are never reset.
pub struct Session {
    pub pairing: Pairing,
    cipher: SessionCipher,
}

impl Session {
    /// Derive the long-lived session keys from the pair-verify shared secret.
    pub fn new(shared: &[u8; 32], pairing: Pairing) -> Result<Self> {
        let encrypt_key = hkdf::derive_control_read_key(shared)?;
        let decrypt_key = hkdf::derive_control_write_key(shared)?;
        Ok(Self {
            pairing,
            cipher: SessionCipher::new(encrypt_key, decrypt_key),
        })
    }

    /// Frame and encrypt one outbound message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.cipher.encrypt(plaintext)?)
    }

    /// Decrypt one chunk read off the wire.
    pub fn decrypt_chunk(&mut self, ciphertext_with_tag: &[u8], chunk_len: u16) -> Result<Vec<u8>> {
        Ok(self.cipher.decrypt_chunk(ciphertext_with_tag, chunk_len)?)
    }

    /// Decrypt a complete buffered message of framed chunks.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.cipher.decrypt(data)?)
    }

    pub fn encrypt_count(&self) -> u64 {
        self.cipher.encrypt_count()
    }

    pub fn decrypt_count(&self) -> u64 {
        self.cipher.decrypt_count()
    }
}
