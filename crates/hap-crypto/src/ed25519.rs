//! Ed25519 signatures for the long-term accessory and controller identities.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hap_core::error::CryptoError;
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

/// Long-term Ed25519 identity key pair.
///
/// Clone is implemented so the accessory identity can be shared between
/// handlers; all copies zeroize on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DeviceKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32], // Ed25519 seed
}

impl DeviceKeyPair {
    /// Generate a new random identity key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            secret: signing_key.to_bytes(),
        }
    }

    /// Create from seed bytes (32 bytes).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            secret: *seed,
        }
    }

    /// Load from the 64-byte stored form: seed followed by public key.
    /// Validates that the public half matches the seed.
    pub fn from_secret(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() != 64 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 64,
                actual: secret.len(),
            });
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&secret[..32]);

        let signing_key = SigningKey::from_bytes(&seed);
        let derived_public = signing_key.verifying_key().to_bytes();
        if derived_public != secret[32..64] {
            return Err(CryptoError::KeyDerivation(
                "Public key does not match seed".to_string(),
            ));
        }

        Ok(Self {
            public: derived_public,
            secret: seed,
        })
    }

    /// Get the public key (32 bytes).
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// The 64-byte stored form: seed followed by public key.
    pub fn secret_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.secret);
        out[32..].copy_from_slice(&self.public);
        out
    }

    /// Sign a message, returning a 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signing_key = SigningKey::from_bytes(&self.secret);
        signing_key.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature over `message` against a raw public key.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let public_key: [u8; 32] =
        public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: public_key.len(),
            })?;
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 64,
            actual: signature.len(),
        })?;

    let verifying_key = VerifyingKey::from_bytes(&public_key)
        .map_err(|e| CryptoError::Encryption(format!("Invalid public key: {}", e)))?;

    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::Encryption("Signature verification failed".to_string()))
}
