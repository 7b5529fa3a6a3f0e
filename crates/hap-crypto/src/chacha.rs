//! ChaCha20-Poly1305 AEAD for pairing messages and the session stream.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hap_core::error::CryptoError;
use zeroize::ZeroizeOnDrop;

/// Maximum plaintext bytes per session stream chunk.
pub const MAX_CHUNK_LEN: usize = 0x400;

/// Encrypt with an explicit 12-byte nonce; returns ciphertext with the
/// 16-byte tag appended. Used for pairing-phase messages (no AAD).
pub fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))
}

/// Decrypt with an explicit 12-byte nonce; expects ciphertext with the
/// 16-byte tag appended.
pub fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < 16 {
        return Err(CryptoError::Decryption(
            "Ciphertext too short (missing tag)".to_string(),
        ));
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption("Decryption/authentication failed".to_string()))
}

/// Build a 12-byte nonce from an ASCII label, right-aligned with zero
/// padding: "PV-Msg02" becomes `\x00\x00\x00\x00PV-Msg02`.
pub fn nonce_from_label(label: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    let len = label.len().min(12);
    nonce[12 - len..].copy_from_slice(&label[..len]);
    nonce
}

/// Build a 12-byte nonce from a stream counter: u64 little-endian in the low
/// 8 bytes, top 4 bytes zero.
fn nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Session stream cipher with per-direction auto-incrementing counters.
///
/// Each chunk on the wire is `[len: u16 LE][ciphertext: len][tag: 16]`, with
/// at most 0x400 plaintext bytes per chunk. A terminal chunk strictly shorter
/// than 0x400 signals end-of-message. The 2 length bytes are the chunk's AAD,
/// binding length to ciphertext. Counters increment by exactly one per chunk
/// and are never reset; nonce reuse would break the AEAD, so counter state is
/// the session's liveness.
#[derive(ZeroizeOnDrop)]
pub struct SessionCipher {
    encrypt_key: [u8; 32],
    decrypt_key: [u8; 32],
    #[zeroize(skip)]
    encrypt_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    decrypt_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    encrypt_count: u64,
    #[zeroize(skip)]
    decrypt_count: u64,
}

impl SessionCipher {
    pub fn new(encrypt_key: [u8; 32], decrypt_key: [u8; 32]) -> Self {
        let encrypt_cipher = ChaCha20Poly1305::new(&encrypt_key.into());
        let decrypt_cipher = ChaCha20Poly1305::new(&decrypt_key.into());
        Self {
            encrypt_key,
            decrypt_key,
            encrypt_cipher,
            decrypt_cipher,
            encrypt_count: 0,
            decrypt_count: 0,
        }
    }

    /// Encrypt one outbound message into the concatenation of framed chunks.
    /// Increments the encrypt counter by the number of chunks emitted.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return Err(CryptoError::Encryption("Empty plaintext".to_string()));
        }

        let mut out =
            Vec::with_capacity(plaintext.len() + (plaintext.len() / MAX_CHUNK_LEN + 1) * 18);
        for block in plaintext.chunks(MAX_CHUNK_LEN) {
            let aad = (block.len() as u16).to_le_bytes();
            let nonce = nonce_from_counter(self.encrypt_count);
            let payload = Payload {
                msg: block,
                aad: &aad,
            };

            let ciphertext_with_tag = self
                .encrypt_cipher
                .encrypt(Nonce::from_slice(&nonce), payload)
                .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))?;

            out.extend_from_slice(&aad);
            out.extend_from_slice(&ciphertext_with_tag);
            self.encrypt_count += 1;
        }

        Ok(out)
    }

    /// Decrypt a single chunk: `ciphertext_with_tag` is the ciphertext plus
    /// 16-byte tag, `chunk_len` the plaintext length from the wire prefix.
    /// Increments the decrypt counter on success; a tag failure leaves the
    /// session dead and the connection must be closed.
    pub fn decrypt_chunk(
        &mut self,
        ciphertext_with_tag: &[u8],
        chunk_len: u16,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_with_tag.len() != chunk_len as usize + 16 {
            return Err(CryptoError::Decryption(
                "Ciphertext block length mismatch".to_string(),
            ));
        }

        let aad = chunk_len.to_le_bytes();
        let nonce = nonce_from_counter(self.decrypt_count);
        let payload = Payload {
            msg: ciphertext_with_tag,
            aad: &aad,
        };

        let plaintext = self
            .decrypt_cipher
            .decrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| CryptoError::Decryption("Decryption/authentication failed".to_string()))?;

        self.decrypt_count += 1;
        Ok(plaintext)
    }

    /// Decrypt a complete buffered message of framed chunks. Terminates when
    /// a chunk shorter than 0x400 is consumed or the buffer ends.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(CryptoError::Decryption(
                    "Incomplete length prefix".to_string(),
                ));
            }
            let chunk_len = u16::from_le_bytes([data[offset], data[offset + 1]]);
            offset += 2;

            let chunk_end = offset + chunk_len as usize + 16;
            if chunk_end > data.len() {
                return Err(CryptoError::Decryption(
                    "Incomplete ciphertext block".to_string(),
                ));
            }

            out.extend_from_slice(&self.decrypt_chunk(&data[offset..chunk_end], chunk_len)?);
            offset = chunk_end;

            if (chunk_len as usize) < MAX_CHUNK_LEN {
                break;
            }
        }

        Ok(out)
    }

    pub fn encrypt_count(&self) -> u64 {
        self.encrypt_count
    }

    pub fn decrypt_count(&self) -> u64 {
        self.decrypt_count
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("encrypt_count", &self.encrypt_count)
            .field("decrypt_count", &self.decrypt_count)
            .finish_non_exhaustive()
    }
}
