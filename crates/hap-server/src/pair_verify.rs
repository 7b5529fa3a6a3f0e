//! Pair-verify endpoint: derives per-connection session keys for an
//! existing pairing.

use std::sync::{Arc, Mutex};

use hap_core::error::tlv_error;
use hap_crypto::tlv::{Tlv8, TlvType};
use hap_pairing::{step, PairVerifySession};
use tracing::{debug, info};

use crate::http::Response;
use crate::registry::SessionState;
use crate::server::Server;
use crate::session::Session;

impl Server {
    /// POST /pair-verify. Failure at any point clears the verify state and
    /// replies Authentication; the connection stays open so the controller
    /// may retry.
    pub(crate) fn pair_verify(&self, addr: &str, body: &[u8]) -> Response {
        let tlv = match Tlv8::parse(body) {
            Ok(tlv) => tlv,
            Err(e) => {
                info!(error = %e, "pair-verify: bad tlv8");
                return Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
            }
        };

        match tlv.state() {
            Some(step::STEP1) => self.pair_verify_step1(addr, &tlv),
            Some(step::STEP3) => self.pair_verify_step3(addr, &tlv),
            state => {
                info!(?state, "pair-verify: invalid state");
                Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN))
            }
        }
    }

    /// Step 1 -> 2: ephemeral key agreement plus our signed identity.
    fn pair_verify_step1(&self, addr: &str, tlv: &Tlv8) -> Response {
        let Some(client_public) = tlv.get(TlvType::PublicKey) else {
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP2, tlv_error::AUTHENTICATION),
            );
        };

        let (session, encrypted) =
            match PairVerifySession::begin(&self.device_id, &self.key, client_public) {
                Ok(ok) => ok,
                Err(e) => {
                    info!(error = %e, "pair-verify: key agreement failed");
                    return Response::tlv(
                        200,
                        Tlv8::error_reply(step::STEP2, tlv_error::AUTHENTICATION),
                    );
                }
            };

        let mut resp = Tlv8::new();
        resp.set(TlvType::PublicKey, session.public_key().to_vec());
        resp.set(TlvType::EncryptedData, encrypted);
        resp.set_byte(TlvType::State, step::STEP2);

        self.registry
            .set_session(addr, SessionState::Verify(session));
        Response::tlv(200, resp)
    }

    /// Step 3 -> 4: controller proof check, then session installation. The
    /// step-4 reply itself travels in plaintext; every byte after it is
    /// encrypted under the new session keys.
    fn pair_verify_step3(&self, addr: &str, tlv: &Tlv8) -> Response {
        let Some(SessionState::Verify(session)) = self.registry.take_session(addr) else {
            info!(%addr, "pair-verify: no verify session");
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP4, tlv_error::AUTHENTICATION),
            );
        };

        let Some(encrypted) = tlv.get(TlvType::EncryptedData) else {
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP4, tlv_error::AUTHENTICATION),
            );
        };

        let (controller_id, signature) = match session.open_controller_proof(encrypted) {
            Ok(ok) => ok,
            Err(e) => {
                info!(error = %e, "pair-verify: opening controller proof failed");
                return Response::tlv(
                    200,
                    Tlv8::error_reply(step::STEP4, tlv_error::AUTHENTICATION),
                );
            }
        };

        let pairing = match self.storer.pairing(&controller_id) {
            Ok(pairing) => pairing,
            Err(_) => {
                info!(controller = %controller_id, "pair-verify: unknown controller");
                return Response::tlv(
                    200,
                    Tlv8::error_reply(step::STEP4, tlv_error::AUTHENTICATION),
                );
            }
        };

        if let Err(e) = session.verify_controller(&pairing.public_key, &controller_id, &signature) {
            info!(error = %e, "pair-verify: controller signature invalid");
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP4, tlv_error::AUTHENTICATION),
            );
        }

        let established = match Session::new(session.shared_secret(), pairing) {
            Ok(session) => session,
            Err(e) => {
                info!(error = %e, "pair-verify: session key derivation failed");
                return Response::tlv(
                    200,
                    Tlv8::error_reply(step::STEP4, tlv_error::AUTHENTICATION),
                );
            }
        };

        debug!(%addr, controller = %controller_id, "session established");
        self.registry.set_session(
            addr,
            SessionState::Established(Arc::new(Mutex::new(established))),
        );

        let mut resp = Tlv8::new();
        resp.set_byte(TlvType::State, step::STEP4);
        Response::tlv(200, resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_core::store::{MemStore, Pairing, PERMISSION_ADMIN};
    use hap_crypto::chacha::{nonce_from_label, seal};
    use hap_crypto::curve25519::EcdhKeyPair;
    use hap_crypto::ed25519::DeviceKeyPair;
    use hap_crypto::hkdf;

    const ADDR: &str = "10.0.0.2:49152";

    fn server_with_pairing(identity: &DeviceKeyPair) -> Server {
        let server = Server::new(MemStore::new(), Vec::new(), "031-45-154").unwrap();
        server
            .storer
            .save_pairing(&Pairing {
                name: "controller-1".to_string(),
                public_key: identity.public_key().to_vec(),
                permission: PERMISSION_ADMIN,
            })
            .unwrap();
        server
    }

    struct VerifyingController {
        identity: DeviceKeyPair,
        ephemeral_public: [u8; 32],
        session_key: [u8; 32],
        shared_secret: [u8; 32],
        server_public: [u8; 32],
    }

    /// Run step 1 from the controller seat against the server handler.
    fn run_step1(server: &Server, identity: DeviceKeyPair) -> VerifyingController {
        let ephemeral = EcdhKeyPair::generate();
        let ephemeral_public = ephemeral.public_key();

        let mut v1 = Tlv8::new();
        v1.set_byte(TlvType::State, step::STEP1);
        v1.set(TlvType::PublicKey, ephemeral_public.to_vec());
        let resp = server.pair_verify(ADDR, &v1.encode());
        let v2 = Tlv8::parse(&resp.body).unwrap();
        assert_eq!(v2.state(), Some(step::STEP2));
        assert!(v2.error().is_none());

        let server_public: [u8; 32] = v2.get(TlvType::PublicKey).unwrap().try_into().unwrap();
        let shared_secret = ephemeral.diffie_hellman(&server_public).unwrap();
        let session_key = hkdf::derive_pair_verify_key(&shared_secret).unwrap();

        VerifyingController {
            identity,
            ephemeral_public,
            session_key,
            shared_secret,
            server_public,
        }
    }

    fn step3_body(controller: &VerifyingController, id: &str) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(&controller.ephemeral_public);
        message.extend_from_slice(id.as_bytes());
        message.extend_from_slice(&controller.server_public);
        let signature = controller.identity.sign(&message);

        let mut inner = Tlv8::new();
        inner.set(TlvType::Identifier, id.as_bytes().to_vec());
        inner.set(TlvType::Signature, signature.to_vec());
        let envelope = seal(
            &controller.session_key,
            &nonce_from_label(b"PV-Msg03"),
            &inner.encode(),
        )
        .unwrap();

        let mut v3 = Tlv8::new();
        v3.set_byte(TlvType::State, step::STEP3);
        v3.set(TlvType::EncryptedData, envelope);
        v3.encode()
    }

    #[test]
    fn full_verify_installs_session() {
        let identity = DeviceKeyPair::generate();
        let server = server_with_pairing(&identity);
        let controller = run_step1(&server, identity);

        let resp = server.pair_verify(ADDR, &step3_body(&controller, "controller-1"));
        let v4 = Tlv8::parse(&resp.body).unwrap();
        assert_eq!(v4.state(), Some(step::STEP4));
        assert!(v4.error().is_none());

        let session = server.registry.established(ADDR).unwrap();
        let mut session = session.lock().unwrap();
        assert_eq!(session.pairing.name, "controller-1");
        assert_eq!(session.encrypt_count(), 0);
        assert_eq!(session.decrypt_count(), 0);

        // Session keys line up with the controller's mirror derivation.
        let controller_decrypt =
            hkdf::derive_control_read_key(&controller.shared_secret).unwrap();
        let mut controller_cipher = hap_crypto::chacha::SessionCipher::new(
            hkdf::derive_control_write_key(&controller.shared_secret).unwrap(),
            controller_decrypt,
        );
        let wire = session.encrypt(b"hello controller").unwrap();
        assert_eq!(
            controller_cipher.decrypt(&wire).unwrap(),
            b"hello controller"
        );
    }

    #[test]
    fn unknown_controller_is_authentication_error() {
        let identity = DeviceKeyPair::generate();
        let server = server_with_pairing(&identity);
        let controller = run_step1(&server, identity);

        let resp = server.pair_verify(ADDR, &step3_body(&controller, "controller-9"));
        let v4 = Tlv8::parse(&resp.body).unwrap();
        assert_eq!(v4.error(), Some(tlv_error::AUTHENTICATION));
        assert!(server.registry.established(ADDR).is_none());
    }

    #[test]
    fn signature_from_wrong_key_is_rejected() {
        let paired = DeviceKeyPair::generate();
        let server = server_with_pairing(&paired);
        // Controller signs with a key other than the paired one.
        let controller = run_step1(&server, DeviceKeyPair::generate());

        let resp = server.pair_verify(ADDR, &step3_body(&controller, "controller-1"));
        let v4 = Tlv8::parse(&resp.body).unwrap();
        assert_eq!(v4.error(), Some(tlv_error::AUTHENTICATION));
        assert!(server.registry.established(ADDR).is_none());
    }

    #[test]
    fn failed_verify_leaves_connection_retryable() {
        let identity = DeviceKeyPair::generate();
        let server = server_with_pairing(&identity);

        // Step 3 with no session at all.
        let mut v3 = Tlv8::new();
        v3.set_byte(TlvType::State, step::STEP3);
        v3.set(TlvType::EncryptedData, vec![0u8; 64]);
        let resp = server.pair_verify(ADDR, &v3.encode());
        assert_eq!(
            Tlv8::parse(&resp.body).unwrap().error(),
            Some(tlv_error::AUTHENTICATION)
        );

        // A fresh step 1 on the same address succeeds.
        let controller = run_step1(&server, identity);
        let resp = server.pair_verify(ADDR, &step3_body(&controller, "controller-1"));
        assert!(Tlv8::parse(&resp.body).unwrap().error().is_none());
    }

    #[test]
    fn step1_without_public_key_fails() {
        let identity = DeviceKeyPair::generate();
        let server = server_with_pairing(&identity);
        let mut v1 = Tlv8::new();
        v1.set_byte(TlvType::State, step::STEP1);
        let resp = server.pair_verify(ADDR, &v1.encode());
        assert_eq!(
            Tlv8::parse(&resp.body).unwrap().error(),
            Some(tlv_error::AUTHENTICATION)
        );
    }
}
