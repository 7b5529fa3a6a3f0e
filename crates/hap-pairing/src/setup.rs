//! Pair-setup server state machine (steps 1-6).
//!
//! Pair-setup runs SRP-6a over the out-of-band PIN so the PIN never crosses
//! the wire, then exchanges long-term Ed25519 identities inside a
//! ChaCha20-Poly1305 envelope keyed from the SRP shared secret.

use hap_core::error::{CryptoError, Error, PairingError, Result};
use hap_crypto::{
    chacha::{nonce_from_label, open, seal},
    ed25519::{self, DeviceKeyPair},
    hkdf,
    srp::SrpServer,
    tlv::{Tlv8, TlvType},
};
use tracing::debug;

const NONCE_MSG05: &[u8] = b"PS-Msg05";
const NONCE_MSG06: &[u8] = b"PS-Msg06";

/// The controller identity carried in the step-5 encrypted payload.
#[derive(Debug, Clone)]
pub struct ControllerExchange {
    pub identifier: String,
    pub public_key: Vec<u8>,
}

/// Server state for one pair-setup exchange.
///
/// Created on step 1; destroyed on completion, failure, or connection close.
pub struct PairSetupSession {
    /// Accessory device identifier sent back in step 6.
    identifier: String,
    srp: SrpServer,
    encryption_key: Option<[u8; 32]>,
}

impl PairSetupSession {
    /// Start a session: computes the SRP verifier from the PIN, picks a
    /// 16-byte salt and the server public key B.
    pub fn new(identifier: &str, pin: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            srp: SrpServer::new(b"Pair-Setup", pin.as_bytes()),
            encryption_key: None,
        }
    }

    /// SRP salt for the step-2 reply.
    pub fn salt(&self) -> [u8; 16] {
        self.srp.salt()
    }

    /// SRP server public key B for the step-2 reply.
    pub fn public_key(&self) -> Vec<u8> {
        self.srp.public_key()
    }

    /// Step 3, first half: install the client public key A and derive the
    /// SRP shared secret S.
    pub fn key_exchange(&mut self, client_public: &[u8]) -> Result<()> {
        self.srp.set_client_public(client_public)?;
        Ok(())
    }

    /// Step 3, second half: verify the client proof M1 and return the server
    /// proof M2 for the step-4 reply.
    pub fn verify_client_proof(&self, client_proof: &[u8]) -> Result<Vec<u8>> {
        self.srp
            .verify_client_proof(client_proof)
            .map_err(|_| PairingError::InvalidClientProof.into())
    }

    /// Derive the 32-byte message encryption key K from the shared secret.
    pub fn derive_encryption_key(&mut self) -> Result<()> {
        let shared = self.shared_secret()?;
        self.encryption_key = Some(hkdf::derive_pair_setup_key(shared)?);
        Ok(())
    }

    /// Step 5: open the PS-Msg05 envelope, parse the inner TLV and verify
    /// the controller signature over
    /// `HKDF(S, Controller-Sign) || controllerId || controllerLTPK`.
    pub fn open_controller_exchange(&self, encrypted: &[u8]) -> Result<ControllerExchange> {
        let key = self.encryption_key()?;
        let decrypted = open(key, &nonce_from_label(NONCE_MSG05), encrypted)?;

        let inner = Tlv8::parse(&decrypted)?;
        let identifier = inner
            .string(TlvType::Identifier)
            .ok_or(PairingError::MissingTlv("identifier"))?;
        let public_key = inner
            .get(TlvType::PublicKey)
            .ok_or(PairingError::MissingTlv("public key"))?;
        let signature = inner
            .get(TlvType::Signature)
            .ok_or(PairingError::MissingTlv("signature"))?;

        let hash = hkdf::derive_key_32(
            self.shared_secret()?,
            hkdf::constants::PAIR_SETUP_CONTROLLER_SIGN_SALT,
            hkdf::constants::PAIR_SETUP_CONTROLLER_SIGN_INFO,
        )?;
        let mut message = Vec::with_capacity(32 + identifier.len() + public_key.len());
        message.extend_from_slice(&hash);
        message.extend_from_slice(identifier.as_bytes());
        message.extend_from_slice(public_key);

        ed25519::verify(public_key, &message, signature)
            .map_err(|_| Error::from(PairingError::SignatureInvalid))?;

        debug!(controller = %identifier, "controller signature valid");

        Ok(ControllerExchange {
            identifier,
            public_key: public_key.to_vec(),
        })
    }

    /// Step 6: sign the accessory identity with the long-term key and seal
    /// it in the PS-Msg06 envelope.
    pub fn seal_accessory_exchange(&self, accessory_key: &DeviceKeyPair) -> Result<Vec<u8>> {
        let hash = hkdf::derive_key_32(
            self.shared_secret()?,
            hkdf::constants::PAIR_SETUP_ACCESSORY_SIGN_SALT,
            hkdf::constants::PAIR_SETUP_ACCESSORY_SIGN_INFO,
        )?;
        let public = accessory_key.public_key();
        let mut message = Vec::with_capacity(32 + self.identifier.len() + 32);
        message.extend_from_slice(&hash);
        message.extend_from_slice(self.identifier.as_bytes());
        message.extend_from_slice(&public);

        let signature = accessory_key.sign(&message);

        let mut inner = Tlv8::new();
        inner.set(TlvType::Identifier, self.identifier.as_bytes().to_vec());
        inner.set(TlvType::PublicKey, public.to_vec());
        inner.set(TlvType::Signature, signature.to_vec());

        let key = self.encryption_key()?;
        Ok(seal(key, &nonce_from_label(NONCE_MSG06), &inner.encode())?)
    }

    fn shared_secret(&self) -> Result<&[u8]> {
        self.srp.shared_secret().ok_or_else(|| {
            CryptoError::KeyDerivation("SRP shared secret not derived".to_string()).into()
        })
    }

    fn encryption_key(&self) -> Result<&[u8; 32]> {
        self.encryption_key.as_ref().ok_or_else(|| {
            CryptoError::KeyDerivation("Encryption key not derived".to_string()).into()
        })
    }
}
