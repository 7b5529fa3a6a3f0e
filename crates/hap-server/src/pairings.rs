//! Pairings administration: add, remove and list controllers post-verify.

use hap_core::error::{json_status, tlv_error};
use hap_core::store::Pairing;
use hap_crypto::tlv::{Tlv8, TlvType};
use hap_pairing::{method, step};
use tracing::{debug, info};

use crate::http::Response;
use crate::server::Server;

impl Server {
    /// POST /pairings. Requires an established session; Add and Delete
    /// additionally require the calling controller to be an admin.
    pub(crate) fn pairings(&self, addr: &str, body: &[u8]) -> Response {
        if !self.storer.is_paired() {
            info!("not paired");
            return json_error(json_status::INSUFFICIENT_PRIVILEGES);
        }

        let Some(session) = self.registry.established(addr) else {
            info!(%addr, "no session");
            return Response::tlv(500, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
        };
        let caller = session
            .lock()
            .expect("session mutex poisoned")
            .pairing
            .clone();

        let tlv = match Tlv8::parse(body) {
            Ok(tlv) => tlv,
            Err(e) => {
                info!(error = %e, "pairings: bad tlv8");
                return Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
            }
        };

        match tlv.byte(TlvType::Method) {
            Some(method::ADD_PAIRING) => self.add_pairing(&caller, &tlv),
            Some(method::DELETE_PAIRING) => self.delete_pairing(&caller, &tlv),
            Some(method::LIST_PAIRINGS) => self.list_pairings(),
            other => {
                info!(?other, "pairings: unknown method");
                Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN))
            }
        }
    }

    fn add_pairing(&self, caller: &Pairing, tlv: &Tlv8) -> Response {
        let Some(identifier) = tlv.string(TlvType::Identifier) else {
            return Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
        };
        debug!(controller = %identifier, "add pairing");

        if !caller.is_admin() {
            info!("operation not allowed for non-admin controllers");
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP2, tlv_error::AUTHENTICATION),
            );
        }

        let public_key = tlv.get(TlvType::PublicKey).unwrap_or_default().to_vec();
        let permission = tlv.byte(TlvType::Permissions).unwrap_or(0);

        let pairing = match self.storer.pairing(&identifier) {
            Err(_) => Pairing {
                name: identifier,
                public_key,
                permission,
            },
            Ok(mut existing) => {
                // An existing pairing may only change permission, and only
                // when the submitted key matches the stored one.
                if existing.public_key != public_key {
                    info!("invalid public key");
                    return Response::tlv(200, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
                }
                existing.permission = permission;
                existing
            }
        };

        if let Err(e) = self.storer.save_pairing(&pairing) {
            info!(error = %e, "saving pairing failed");
            return Response::tlv(200, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
        }

        let mut resp = Tlv8::new();
        resp.set_byte(TlvType::State, step::STEP2);
        Response::tlv(200, resp)
    }

    fn delete_pairing(&self, caller: &Pairing, tlv: &Tlv8) -> Response {
        let Some(identifier) = tlv.string(TlvType::Identifier) else {
            return Response::tlv(400, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
        };
        debug!(controller = %identifier, "delete pairing");

        if !caller.is_admin() {
            info!("operation not allowed for non-admin controllers");
            return Response::tlv(
                200,
                Tlv8::error_reply(step::STEP2, tlv_error::AUTHENTICATION),
            );
        }

        let removed = match self.storer.pairing(&identifier) {
            Ok(pairing) => pairing,
            Err(e) => {
                info!(error = %e, "unknown pairing");
                return Response::tlv(200, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
            }
        };

        if let Err(e) = self.storer.delete_pairing(&removed.name) {
            info!(error = %e, "deleting pairing failed");
            return Response::tlv(200, Tlv8::error_reply(step::STEP2, tlv_error::UNKNOWN));
        }

        let mut resp = Tlv8::new();
        resp.set_byte(TlvType::State, step::STEP2);
        let response = Response::tlv(200, resp);

        // With no admin left the accessory is effectively unpaired: tear
        // down every connection.
        if !self.storer.paired_with_admin() {
            for (addr, conn) in self.registry.conns() {
                debug!(%addr, "closing connection");
                conn.close();
            }
            return response;
        }

        // Otherwise only the removed controller's connections go away.
        for (addr, conn) in self.registry.conns() {
            match self.registry.session_pairing_name(&addr) {
                Some(name) if name == removed.name => {
                    debug!(%addr, controller = %name, "closing connection of removed controller");
                    conn.close();
                }
                _ => {}
            }
        }

        response
    }

    fn list_pairings(&self) -> Response {
        debug!("list pairings");

        // Records repeat per pairing, so the payload is built raw with a
        // separator record between entries.
        let mut body = Vec::new();
        let mut state = Tlv8::new();
        state.set_byte(TlvType::State, step::STEP2);
        body.extend_from_slice(&state.encode());

        let pairings = self.storer.pairings();
        for (i, pairing) in pairings.iter().enumerate() {
            if i > 0 {
                body.extend_from_slice(&[TlvType::Separator as u8, 0]);
            }
            let mut record = Tlv8::new();
            record.set(TlvType::Identifier, pairing.name.as_bytes().to_vec());
            record.set(TlvType::PublicKey, pairing.public_key.clone());
            record.set_byte(TlvType::Permissions, pairing.permission);
            body.extend_from_slice(&record.encode());
        }

        Response::tlv_bytes(200, body)
    }
}

fn json_error(status: i32) -> Response {
    let body = serde_json::json!({ "status": status });
    Response::json(400, body.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use hap_core::store::{MemStore, PERMISSION_ADMIN, PERMISSION_USER};
    use tokio::sync::mpsc;

    use crate::registry::{ConnCommand, ConnHandle, SessionState};
    use crate::session::Session;

    const ADMIN_ADDR: &str = "10.0.0.2:49152";
    const USER_ADDR: &str = "10.0.0.3:49153";

    fn pairing(name: &str, permission: u8) -> Pairing {
        Pairing {
            name: name.to_string(),
            public_key: vec![0xAB; 32],
            permission,
        }
    }

    /// Server with persisted pairings and an established session per entry.
    fn server_with_sessions(entries: &[(&str, &Pairing)]) -> Server {
        let server = Server::new(MemStore::new(), Vec::new(), "031-45-154").unwrap();
        for (addr, pairing) in entries {
            server.storer.save_pairing(pairing).unwrap();
            let session = Session::new(&[0x42; 32], (*pairing).clone()).unwrap();
            server
                .registry
                .set_session(addr, SessionState::Established(Arc::new(Mutex::new(session))));
        }
        server
    }

    fn attach_conn(server: &Server, addr: &str) -> mpsc::UnboundedReceiver<ConnCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.registry.set_conn(addr, ConnHandle::new(tx));
        rx
    }

    fn add_body(identifier: &str, public_key: &[u8], permission: u8) -> Vec<u8> {
        let mut tlv = Tlv8::new();
        tlv.set_byte(TlvType::Method, method::ADD_PAIRING);
        tlv.set_byte(TlvType::State, step::STEP1);
        tlv.set(TlvType::Identifier, identifier.as_bytes().to_vec());
        tlv.set(TlvType::PublicKey, public_key.to_vec());
        tlv.set_byte(TlvType::Permissions, permission);
        tlv.encode()
    }

    fn delete_body(identifier: &str) -> Vec<u8> {
        let mut tlv = Tlv8::new();
        tlv.set_byte(TlvType::Method, method::DELETE_PAIRING);
        tlv.set_byte(TlvType::State, step::STEP1);
        tlv.set(TlvType::Identifier, identifier.as_bytes().to_vec());
        tlv.encode()
    }

    fn list_body() -> Vec<u8> {
        let mut tlv = Tlv8::new();
        tlv.set_byte(TlvType::Method, method::LIST_PAIRINGS);
        tlv.set_byte(TlvType::State, step::STEP1);
        tlv.encode()
    }

    fn closed(rx: &mut mpsc::UnboundedReceiver<ConnCommand>) -> bool {
        loop {
            match rx.try_recv() {
                Ok(ConnCommand::Close) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    }

    #[test]
    fn add_pairing_creates_record() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin)]);

        let resp = server.pairings(ADMIN_ADDR, &add_body("phone-2", &[0xCD; 32], PERMISSION_USER));
        let tlv = Tlv8::parse(&resp.body).unwrap();
        assert_eq!(tlv.state(), Some(step::STEP2));
        assert!(tlv.error().is_none());

        let stored = server.storer.pairing("phone-2").unwrap();
        assert_eq!(stored.public_key, vec![0xCD; 32]);
        assert_eq!(stored.permission, PERMISSION_USER);
    }

    #[test]
    fn add_pairing_updates_permission_when_key_matches() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let user = pairing("phone-2", PERMISSION_USER);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin)]);
        server.storer.save_pairing(&user).unwrap();

        let resp = server.pairings(
            ADMIN_ADDR,
            &add_body("phone-2", &user.public_key, PERMISSION_ADMIN),
        );
        assert!(Tlv8::parse(&resp.body).unwrap().error().is_none());
        assert_eq!(
            server.storer.pairing("phone-2").unwrap().permission,
            PERMISSION_ADMIN
        );
    }

    #[test]
    fn add_pairing_rejects_mismatched_public_key() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let user = pairing("phone-2", PERMISSION_USER);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin)]);
        server.storer.save_pairing(&user).unwrap();

        let resp = server.pairings(
            ADMIN_ADDR,
            &add_body("phone-2", &[0xEE; 32], PERMISSION_ADMIN),
        );
        let tlv = Tlv8::parse(&resp.body).unwrap();
        assert_eq!(tlv.error(), Some(tlv_error::UNKNOWN));
        // Unchanged.
        assert_eq!(
            server.storer.pairing("phone-2").unwrap().permission,
            PERMISSION_USER
        );
    }

    #[test]
    fn non_admin_cannot_add_or_delete() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let user = pairing("phone-2", PERMISSION_USER);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin), (USER_ADDR, &user)]);

        let resp = server.pairings(USER_ADDR, &add_body("phone-3", &[0xCD; 32], 0));
        assert_eq!(
            Tlv8::parse(&resp.body).unwrap().error(),
            Some(tlv_error::AUTHENTICATION)
        );

        let resp = server.pairings(USER_ADDR, &delete_body("admin"));
        assert_eq!(
            Tlv8::parse(&resp.body).unwrap().error(),
            Some(tlv_error::AUTHENTICATION)
        );
        assert!(server.storer.pairing("admin").is_ok());
    }

    #[test]
    fn list_pairings_enumerates_records() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let user = pairing("phone-2", PERMISSION_USER);
        let server = server_with_sessions(&[(USER_ADDR, &user)]);
        server.storer.save_pairing(&admin).unwrap();

        // List is allowed for any verified controller.
        let resp = server.pairings(USER_ADDR, &list_body());
        assert_eq!(resp.status, 200);

        // Two records separated by 0xFF; both identifiers present.
        let separators = resp.body.windows(2).filter(|w| w == &[0xFF, 0]).count();
        assert_eq!(separators, 1);
        let body = resp.body.clone();
        let find = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        assert!(find(b"admin"));
        assert!(find(b"phone-2"));
    }

    #[test]
    fn deleting_last_admin_closes_every_connection() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let user = pairing("phone-2", PERMISSION_USER);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin), (USER_ADDR, &user)]);
        let mut admin_rx = attach_conn(&server, ADMIN_ADDR);
        let mut user_rx = attach_conn(&server, USER_ADDR);

        let resp = server.pairings(ADMIN_ADDR, &delete_body("admin"));
        let tlv = Tlv8::parse(&resp.body).unwrap();
        assert_eq!(tlv.state(), Some(step::STEP2));
        assert!(tlv.error().is_none());

        assert!(closed(&mut admin_rx));
        assert!(closed(&mut user_rx));
        assert!(server.storer.pairing("admin").is_err());
    }

    #[test]
    fn deleting_user_closes_only_its_connections() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let user = pairing("phone-2", PERMISSION_USER);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin), (USER_ADDR, &user)]);
        let mut admin_rx = attach_conn(&server, ADMIN_ADDR);
        let mut user_rx = attach_conn(&server, USER_ADDR);

        let resp = server.pairings(ADMIN_ADDR, &delete_body("phone-2"));
        assert!(Tlv8::parse(&resp.body).unwrap().error().is_none());

        assert!(!closed(&mut admin_rx));
        assert!(closed(&mut user_rx));
    }

    #[test]
    fn delete_unknown_pairing_is_unknown_error() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin)]);
        let resp = server.pairings(ADMIN_ADDR, &delete_body("nobody"));
        assert_eq!(
            Tlv8::parse(&resp.body).unwrap().error(),
            Some(tlv_error::UNKNOWN)
        );
    }

    #[test]
    fn requires_established_session() {
        let admin = pairing("admin", PERMISSION_ADMIN);
        let server = server_with_sessions(&[(ADMIN_ADDR, &admin)]);
        let resp = server.pairings("10.9.9.9:1", &list_body());
        assert_eq!(resp.status, 500);
    }

    #[test]
    fn unpaired_accessory_reports_insufficient_privileges() {
        let server = Server::new(MemStore::new(), Vec::new(), "031-45-154").unwrap();
        let resp = server.pairings(ADMIN_ADDR, &list_body());
        assert_eq!(resp.status, 400);
        let body = String::from_utf8(resp.body).unwrap();
        assert!(body.contains("-70401"));
    }
}
