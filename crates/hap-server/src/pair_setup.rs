//! Pair-setup endpoint: bootstraps the first admin pairing from the PIN.

use hap_core::error::tlv_error;
use hap_core::store::{Pairing, PERMISSION_ADMIN};
use hap_crypto::tlv::{Tlv8, TlvType};
use hap_pairing::{method, step, PairSetupSession};
use tracing::{debug, info};

use crate::http::Response;
use crate::registry::SessionState;
use crate::server::Server;

impl Server {
    /// POST /pair-setup. TLV8 in, TLV8 out; the State record selects the
    /// protocol step, the Method record must be plain pairing.
    pub(crate) fn pair_setup(&self, addr: &str, body: &[u8]) -> Response {
        // Pairing is only allowed while the accessory has no pairings.
        if self.storer.is_paired() {
            info!("pairing is not allowed");
            return Response::tlv(200, Tlv8::error_reply(step::STEP2, tlv_error::UNAVAILABLE));
        }

        // Pair-setup can only be run by one controller at a time. A retry
        // from the same address overwrites its own session.
        if self.registry.another_addr_has_session(addr) {
            info!("simultaneous pairings are not allowed");
            return Response::tlv(200, Tlv8::error_reply(step::STEP2, tlv_error::BUSY));
        }

        let tlv = match Tlv8::parse(body) {
            Ok(tlv) => tlv,
            Err(e) => {
                info!(error = %e, "pair-setup: bad tlv8");
                return Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
            }
        };

        match tlv.byte(TlvType::Method).unwrap_or(method::PAIR) {
            method::PAIR => match tlv.state() {
                Some(step::STEP1) => self.pair_setup_step1(addr),
                Some(step::STEP3) => self.pair_setup_step3(addr, &tlv),
                Some(step::STEP5) => self.pair_setup_step5(addr, &tlv),
                state => {
                    info!(?state, "pair-setup: invalid state");
                    Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN))
                }
            },
            method::PAIR_MFI => Response::tlv(
                400,
                Tlv8::error_reply(step::STEP2, tlv_error::INVALID_REQUEST),
            ),
            other => {
                info!(method = other, "pair-setup: invalid method");
                Response::tlv(400, Tlv8::error_reply(0, tlv_error::INVALID_REQUEST))
            }
        }
    }

    /// Step 1 -> 2: create the SRP session, reply with salt and B.
    fn pair_setup_step1(&self, addr: &str) -> Response {
        let session = PairSetupSession::new(&self.device_id, &self.pin);

        let mut resp = Tlv8::new();
        resp.set(TlvType::Salt, session.salt().to_vec());
        resp.set(TlvType::PublicKey, session.public_key());
        resp.set_byte(TlvType::State, step::STEP2);

        self.registry.set_session(addr, SessionState::Setup(session));
        Response::tlv(200, resp)
    }

    /// Step 3 -> 4: key exchange, client proof check, server proof reply.
    fn pair_setup_step3(&self, addr: &str, tlv: &Tlv8) -> Response {
        let Some(SessionState::Setup(mut session)) = self.registry.take_session(addr) else {
            info!(%addr, "pair-setup: no setup session");
            return Response::tlv(500, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
        };

        let Some(client_public) = tlv.get(TlvType::PublicKey) else {
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP4, tlv_error::INVALID_REQUEST),
            );
        };
        if let Err(e) = session.key_exchange(client_public) {
            info!(error = %e, "pair-setup: key exchange failed");
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP4, tlv_error::INVALID_REQUEST),
            );
        }

        let proof = match tlv.get(TlvType::Proof) {
            Some(client_proof) => match session.verify_client_proof(client_proof) {
                Ok(proof) => proof,
                Err(e) => {
                    info!(error = %e, "pair-setup: client proof invalid");
                    return Response::tlv(
                        200,
                        Tlv8::error_reply(step::STEP4, tlv_error::INVALID_REQUEST),
                    );
                }
            },
            None => {
                return Response::tlv(
                    200,
                    Tlv8::error_reply(step::STEP4, tlv_error::INVALID_REQUEST),
                );
            }
        };

        if let Err(e) = session.derive_encryption_key() {
            info!(error = %e, "pair-setup: key derivation failed");
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP4, tlv_error::INVALID_REQUEST),
            );
        }

        let mut resp = Tlv8::new();
        resp.set(TlvType::Proof, proof);
        resp.set_byte(TlvType::State, step::STEP4);

        self.registry.set_session(addr, SessionState::Setup(session));
        Response::tlv(200, resp)
    }

    /// Step 5 -> 6: identity exchange. Verifies the controller identity,
    /// proves ours, and persists the new admin pairing.
    fn pair_setup_step5(&self, addr: &str, tlv: &Tlv8) -> Response {
        let Some(SessionState::Setup(session)) = self.registry.take_session(addr) else {
            info!(%addr, "pair-setup: no setup session");
            return Response::tlv(500, Tlv8::error_reply(step::STEP6, tlv_error::UNKNOWN));
        };

        let Some(encrypted) = tlv.get(TlvType::EncryptedData) else {
            return Response::tlv(400, Tlv8::error_reply(step::STEP6, tlv_error::UNKNOWN));
        };

        let exchange = match session.open_controller_exchange(encrypted) {
            Ok(exchange) => exchange,
            Err(e) => {
                info!(error = %e, "pair-setup: controller exchange rejected");
                return Response::tlv(
                    200,
                    Tlv8::error_reply(step::STEP6, tlv_error::INVALID_REQUEST),
                );
            }
        };

        let encrypted = match session.seal_accessory_exchange(&self.key) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                info!(error = %e, "pair-setup: accessory exchange failed");
                return Response::tlv(
                    200,
                    Tlv8::error_reply(step::STEP6, tlv_error::INVALID_REQUEST),
                );
            }
        };

        let mut resp = Tlv8::new();
        resp.set(TlvType::EncryptedData, encrypted);
        resp.set_byte(TlvType::State, step::STEP6);

        debug!(controller = %exchange.identifier, "storing controller public key");
        let pairing = Pairing {
            name: exchange.identifier,
            public_key: exchange.public_key,
            permission: PERMISSION_ADMIN,
        };
        if let Err(e) = self.storer.save_pairing(&pairing) {
            info!(error = %e, "pair-setup: persisting pairing failed");
            return Response::tlv(200, Tlv8::error_reply(step::STEP6, tlv_error::UNKNOWN));
        }

        // Setup state is spent; the session was already taken from the
        // registry and drops here.
        Response::tlv(200, resp)
    }
}
