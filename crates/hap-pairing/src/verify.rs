//! Pair-verify server state machine (steps 1-4).
//!
//! Given an existing pairing, derives per-connection symmetric keys through
//! an ephemeral X25519 exchange authenticated by both long-term Ed25519
//! identities.

use hap_core::error::{PairingError, Result};
use hap_crypto::{
    chacha::{nonce_from_label, open, seal},
    curve25519::EcdhKeyPair,
    ed25519::{self, DeviceKeyPair},
    hkdf,
    tlv::{Tlv8, TlvType},
};
use tracing::debug;
use zeroize::ZeroizeOnDrop;

const NONCE_MSG02: &[u8] = b"PV-Msg02";
const NONCE_MSG03: &[u8] = b"PV-Msg03";

/// Server state for one pair-verify exchange.
///
/// Created on step 1; replaced by an established session on step-4 success,
/// or destroyed on failure.
#[derive(ZeroizeOnDrop)]
pub struct PairVerifySession {
    #[zeroize(skip)]
    public_key: [u8; 32],
    #[zeroize(skip)]
    client_public: [u8; 32],
    shared_secret: [u8; 32],
    session_key: [u8; 32],
}

impl PairVerifySession {
    /// Step 1: take the controller's ephemeral public key A, generate our
    /// own ephemeral key pair, derive the shared secret and the message
    /// encryption key, and build the sealed accessory proof for the step-2
    /// reply (`sign(B || accessoryId || A)` inside a PV-Msg02 envelope).
    ///
    /// Returns the session and the encrypted payload; the caller replies
    /// with `{State=2, PublicKey=B, EncryptedData}`.
    pub fn begin(
        accessory_id: &str,
        accessory_key: &DeviceKeyPair,
        client_public: &[u8],
    ) -> Result<(Self, Vec<u8>)> {
        let client_public: [u8; 32] = client_public
            .try_into()
            .map_err(|_| PairingError::MissingTlv("client public key"))?;

        let ephemeral = EcdhKeyPair::generate();
        let public_key = ephemeral.public_key();
        let shared_secret = ephemeral.diffie_hellman(&client_public)?;
        let session_key = hkdf::derive_pair_verify_key(&shared_secret)?;

        let mut message = Vec::with_capacity(32 + accessory_id.len() + 32);
        message.extend_from_slice(&public_key);
        message.extend_from_slice(accessory_id.as_bytes());
        message.extend_from_slice(&client_public);
        let signature = accessory_key.sign(&message);

        let mut inner = Tlv8::new();
        inner.set(TlvType::Identifier, accessory_id.as_bytes().to_vec());
        inner.set(TlvType::Signature, signature.to_vec());

        let encrypted = seal(&session_key, &nonce_from_label(NONCE_MSG02), &inner.encode())?;

        debug!(accessory = %accessory_id, "pair-verify started");

        Ok((
            Self {
                public_key,
                client_public,
                shared_secret,
                session_key,
            },
            encrypted,
        ))
    }

    /// Our ephemeral public key B for the step-2 reply.
    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Step 3, first half: open the PV-Msg03 envelope and extract the
    /// controller identifier and signature. The caller looks up the pairing
    /// for the identifier, then calls [`Self::verify_controller`].
    pub fn open_controller_proof(&self, encrypted: &[u8]) -> Result<(String, Vec<u8>)> {
        let decrypted = open(&self.session_key, &nonce_from_label(NONCE_MSG03), encrypted)?;
        let inner = Tlv8::parse(&decrypted)?;

        let identifier = inner
            .string(TlvType::Identifier)
            .ok_or(PairingError::MissingTlv("identifier"))?;
        let signature = inner
            .get(TlvType::Signature)
            .ok_or(PairingError::MissingTlv("signature"))?;

        Ok((identifier, signature.to_vec()))
    }

    /// Step 3, second half: verify the controller signature over
    /// `A || controllerId || B` against the paired long-term public key.
    pub fn verify_controller(
        &self,
        controller_public: &[u8],
        controller_id: &str,
        signature: &[u8],
    ) -> Result<()> {
        let mut message = Vec::with_capacity(32 + controller_id.len() + 32);
        message.extend_from_slice(&self.client_public);
        message.extend_from_slice(controller_id.as_bytes());
        message.extend_from_slice(&self.public_key);

        ed25519::verify(controller_public, &message, signature)
            .map_err(|_| PairingError::SignatureInvalid)?;

        debug!(controller = %controller_id, "pair-verify signature valid");
        Ok(())
    }

    /// The X25519 shared secret the long-lived session keys derive from.
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }
}
