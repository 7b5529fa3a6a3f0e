//! Characteristic access protocol: JSON over HTTP reads and writes.

use hap_core::accessory::{find_characteristic, RequestContext};
use hap_core::error::json_status;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::http::{Request, Response};
use crate::server::Server;

/// One element of a characteristic read/write exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacteristicData {
    #[serde(default)]
    pub aid: u64,
    #[serde(default)]
    pub iid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, rename = "perms", skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(default, rename = "ev", skip_serializing_if = "Option::is_none")]
    pub events: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, rename = "minValue", skip_serializing_if = "Option::is_none")]
    pub min_value: Option<Value>,
    #[serde(default, rename = "maxValue", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<Value>,
    #[serde(default, rename = "minStep", skip_serializing_if = "Option::is_none")]
    pub min_step: Option<Value>,
    #[serde(default, rename = "maxLen", skip_serializing_if = "Option::is_none")]
    pub max_len: Option<i32>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CharacteristicsPayload {
    characteristics: Vec<CharacteristicData>,
}

impl Server {
    /// GET /characteristics?id=aid.iid,... with optional projection flags
    /// `meta`, `perms`, `type` and `ev`.
    pub(crate) fn get_characteristics(&self, addr: &str, req: &Request) -> Response {
        if self.registry.established(addr).is_none() {
            info!(%addr, "characteristics read without session");
            return json_error(json_status::INSUFFICIENT_PRIVILEGES);
        }

        let Some(id) = req.query.get("id").filter(|v| !v.is_empty()) else {
            return json_error(json_status::INVALID_VALUE_IN_REQUEST);
        };
        let meta = req.query_flag("meta");
        let perms = req.query_flag("perms");
        let typ = req.query_flag("type");
        let ev = req.query_flag("ev");

        let ctx = RequestContext {
            remote_addr: addr.to_string(),
        };
        let mut arr = Vec::new();
        let mut failed = false;

        let mut accessories = self.accessories.lock().expect("accessory mutex poisoned");
        for pair in id.split(',') {
            let ids: Vec<&str> = pair.split('.').collect();
            if ids.len() != 2 {
                continue;
            }
            let mut cdata = CharacteristicData {
                aid: ids[0].parse().unwrap_or(0),
                iid: ids[1].parse().unwrap_or(0),
                ..Default::default()
            };

            let Some(c) = find_characteristic(&mut accessories, cdata.aid, cdata.iid) else {
                failed = true;
                cdata.status = Some(json_status::SERVICE_COMMUNICATION_FAILURE);
                arr.push(cdata);
                continue;
            };

            cdata.value = Some(c.value_request(&ctx));

            if meta {
                cdata.format = Some(c.format.clone());
                cdata.unit = Some(c.unit.clone());
                cdata.min_value = c.min_value.clone();
                cdata.max_value = c.max_value.clone();
                cdata.min_step = c.min_step.clone();
                if c.max_len > 0 {
                    cdata.max_len = Some(c.max_len);
                }
            }
            if ev {
                cdata.events = Some(c.event_subscription(addr));
            }
            if perms {
                cdata.permissions = Some(c.permissions.clone());
            }
            if typ {
                cdata.type_tag = Some(c.type_tag.clone());
            }
            arr.push(cdata);
        }
        drop(accessories);

        let body = payload_bytes(arr);
        debug!(%addr, body = %String::from_utf8_lossy(&body), "characteristics read");
        if failed {
            Response::json(207, body)
        } else {
            Response::json(200, body)
        }
    }

    /// PUT /characteristics with a JSON body of write, subscribe and echo
    /// requests. Replies 204 when nothing produced an entry, 207 otherwise.
    pub(crate) fn put_characteristics(&self, addr: &str, body: &[u8]) -> Response {
        if self.registry.established(addr).is_none() {
            info!(%addr, "characteristics write without session");
            return json_error(json_status::INSUFFICIENT_PRIVILEGES);
        }

        let payload: CharacteristicsPayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                info!(error = %e, "characteristics: bad json");
                return json_error(json_status::INVALID_VALUE_IN_REQUEST);
            }
        };

        let ctx = RequestContext {
            remote_addr: addr.to_string(),
        };
        let mut arr: Vec<CharacteristicData> = Vec::new();
        let mut written: Vec<(u64, u64)> = Vec::new();

        let mut accessories = self.accessories.lock().expect("accessory mutex poisoned");
        for d in payload.characteristics {
            let Some(c) = find_characteristic(&mut accessories, d.aid, d.iid) else {
                arr.push(CharacteristicData {
                    aid: d.aid,
                    iid: d.iid,
                    status: Some(json_status::SERVICE_COMMUNICATION_FAILURE),
                    ..Default::default()
                });
                continue;
            };

            if let Some(value) = d.value.filter(|v| !v.is_null()) {
                match c.set_value_request(value, Some(&ctx)) {
                    Ok(()) => written.push((d.aid, d.iid)),
                    Err(status) => arr.push(CharacteristicData {
                        aid: d.aid,
                        iid: d.iid,
                        status: Some(status),
                        ..Default::default()
                    }),
                }
            }

            if let Some(enabled) = d.events {
                if !c.is_observable() {
                    arr.push(CharacteristicData {
                        aid: d.aid,
                        iid: d.iid,
                        status: Some(json_status::NOTIFICATION_NOT_SUPPORTED),
                        ..Default::default()
                    });
                } else {
                    c.set_event_subscription(addr, enabled);
                }
            }

            if d.response == Some(true) {
                arr.push(CharacteristicData {
                    aid: d.aid,
                    iid: d.iid,
                    value: Some(c.value_request(&ctx)),
                    ..Default::default()
                });
            }
        }
        drop(accessories);

        // Writes fan out to every subscribed connection except the writer.
        self.notify_change(&written, Some(addr));

        if arr.is_empty() {
            return Response::new(204);
        }
        let body = payload_bytes(arr);
        debug!(%addr, body = %String::from_utf8_lossy(&body), "characteristics write");
        Response::json(207, body)
    }
}

pub(crate) fn payload_bytes(characteristics: Vec<CharacteristicData>) -> Vec<u8> {
    serde_json::to_vec(&CharacteristicsPayload { characteristics })
        .expect("characteristic payload serialization cannot fail")
}

fn json_error(status: i32) -> Response {
    let body = serde_json::json!({ "status": status });
    Response::json(400, body.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use hap_core::accessory::{type_tag, Accessory, Characteristic, Service};
    use hap_core::store::{MemStore, Pairing, PERMISSION_ADMIN};
    use serde_json::json;

    use crate::registry::SessionState;
    use crate::session::Session;

    const ADDR: &str = "10.0.0.2:49152";
    const OTHER_ADDR: &str = "10.0.0.3:49153";

    /// Primary accessory plus one bridged lightbulb. The info service takes
    /// iids 1..=7, the lightbulb service 8, the On characteristic 9.
    fn accessories() -> Vec<Accessory> {
        let primary = Accessory::new(1, "Bridge", "Acme", "B1", "0001");
        let mut bulb = Accessory::new(2, "Bulb", "Acme", "L1", "0002");
        bulb.add_service(
            Service::new(type_tag::LIGHTBULB)
                .add_characteristic(Characteristic::bool(type_tag::ON, false)),
        );
        vec![primary, bulb]
    }

    fn server_with_session(addr: &str) -> Server {
        let server = Server::new(MemStore::new(), accessories(), "031-45-154").unwrap();
        install_session(&server, addr);
        server
    }

    fn install_session(server: &Server, addr: &str) {
        let pairing = Pairing {
            name: format!("controller-{}", addr),
            public_key: vec![0xAB; 32],
            permission: PERMISSION_ADMIN,
        };
        let session = Session::new(&[0x42; 32], pairing).unwrap();
        server
            .registry
            .set_session(addr, SessionState::Established(Arc::new(Mutex::new(session))));
    }

    fn get(server: &Server, addr: &str, query: &str) -> Response {
        let raw = format!("GET /characteristics?{} HTTP/1.1\r\n\r\n", query);
        let req = Request::parse(raw.as_bytes()).unwrap();
        server.get_characteristics(addr, &req)
    }

    fn parse(resp: &Response) -> Vec<CharacteristicData> {
        let payload: CharacteristicsPayload = serde_json::from_slice(&resp.body).unwrap();
        payload.characteristics
    }

    mod read {
        use super::*;

        #[test]
        fn reads_name_characteristic() {
            let server = server_with_session(ADDR);
            // Name is the fourth info-service characteristic: iid 5.
            let resp = get(&server, ADDR, "id=2.5");
            assert_eq!(resp.status, 200);
            let arr = parse(&resp);
            assert_eq!(arr.len(), 1);
            assert_eq!(arr[0].value, Some(json!("Bulb")));
            assert!(arr[0].status.is_none());
        }

        #[test]
        fn missing_characteristic_yields_multi_status() {
            let server = server_with_session(ADDR);
            let resp = get(&server, ADDR, "id=2.9,7.1");
            assert_eq!(resp.status, 207);
            let arr = parse(&resp);
            assert_eq!(arr.len(), 2);
            assert!(arr[0].status.is_none());
            assert_eq!(
                arr[1].status,
                Some(json_status::SERVICE_COMMUNICATION_FAILURE)
            );
        }

        #[test]
        fn meta_projects_format_and_unit() {
            let server = server_with_session(ADDR);
            let resp = get(&server, ADDR, "id=2.9&meta=1&perms=1&type=1&ev=1");
            let arr = parse(&resp);
            assert_eq!(arr[0].format.as_deref(), Some("bool"));
            assert_eq!(arr[0].unit.as_deref(), Some(""));
            assert!(arr[0].max_len.is_none());
            assert_eq!(
                arr[0].permissions.as_ref().unwrap(),
                &vec!["pr".to_string(), "pw".to_string(), "ev".to_string()]
            );
            assert_eq!(arr[0].type_tag.as_deref(), Some(type_tag::ON));
            assert_eq!(arr[0].events, Some(false));
        }

        #[test]
        fn malformed_id_pairs_are_skipped() {
            let server = server_with_session(ADDR);
            let resp = get(&server, ADDR, "id=2.9,bogus,1");
            assert_eq!(resp.status, 200);
            assert_eq!(parse(&resp).len(), 1);
        }

        #[test]
        fn missing_id_is_invalid_value() {
            let server = server_with_session(ADDR);
            let raw = b"GET /characteristics HTTP/1.1\r\n\r\n";
            let req = Request::parse(raw).unwrap();
            let resp = server.get_characteristics(ADDR, &req);
            assert_eq!(resp.status, 400);
        }

        #[test]
        fn requires_session() {
            let server = server_with_session(ADDR);
            let resp = get(&server, "10.9.9.9:1", "id=2.9");
            assert_eq!(resp.status, 400);
            assert!(String::from_utf8(resp.body).unwrap().contains("-70401"));
        }
    }

    mod write {
        use super::*;

        fn put(server: &Server, addr: &str, body: Value) -> Response {
            server.put_characteristics(addr, body.to_string().as_bytes())
        }

        #[test]
        fn plain_write_returns_no_content_and_stores() {
            let server = server_with_session(ADDR);
            let resp = put(
                &server,
                ADDR,
                json!({"characteristics": [{"aid": 2, "iid": 9, "value": true}]}),
            );
            assert_eq!(resp.status, 204);

            let mut accessories = server.accessories.lock().unwrap();
            let c = find_characteristic(&mut accessories, 2, 9).unwrap();
            assert_eq!(c.value(), &json!(true));
        }

        #[test]
        fn response_flag_echoes_post_write_value() {
            let server = server_with_session(ADDR);
            let resp = put(
                &server,
                ADDR,
                json!({"characteristics": [{"aid": 2, "iid": 9, "value": true, "r": true}]}),
            );
            assert_eq!(resp.status, 207);
            let arr = parse(&resp);
            assert_eq!(arr.len(), 1);
            assert_eq!(arr[0].value, Some(json!(true)));
        }

        #[test]
        fn unknown_target_reports_communication_failure() {
            let server = server_with_session(ADDR);
            let resp = put(
                &server,
                ADDR,
                json!({"characteristics": [{"aid": 9, "iid": 9, "value": true}]}),
            );
            assert_eq!(resp.status, 207);
            let arr = parse(&resp);
            assert_eq!(
                arr[0].status,
                Some(json_status::SERVICE_COMMUNICATION_FAILURE)
            );
        }

        #[test]
        fn write_to_read_only_is_rejected() {
            let server = server_with_session(ADDR);
            // iid 5 is the read-only Name characteristic.
            let resp = put(
                &server,
                ADDR,
                json!({"characteristics": [{"aid": 2, "iid": 5, "value": "x"}]}),
            );
            assert_eq!(resp.status, 207);
            let arr = parse(&resp);
            assert_eq!(arr[0].status, Some(json_status::INVALID_VALUE_IN_REQUEST));
        }

        #[test]
        fn subscribe_on_observable_updates_events_map() {
            let server = server_with_session(ADDR);
            let resp = put(
                &server,
                ADDR,
                json!({"characteristics": [{"aid": 2, "iid": 9, "ev": true}]}),
            );
            assert_eq!(resp.status, 204);

            let mut accessories = server.accessories.lock().unwrap();
            let c = find_characteristic(&mut accessories, 2, 9).unwrap();
            assert!(c.event_subscription(ADDR));
            assert!(!c.event_subscription(OTHER_ADDR));
        }

        #[test]
        fn subscribe_on_non_observable_is_rejected() {
            let server = server_with_session(ADDR);
            // Name (iid 5) has no ev permission.
            let resp = put(
                &server,
                ADDR,
                json!({"characteristics": [{"aid": 2, "iid": 5, "ev": true}]}),
            );
            assert_eq!(resp.status, 207);
            let arr = parse(&resp);
            assert_eq!(
                arr[0].status,
                Some(json_status::NOTIFICATION_NOT_SUPPORTED)
            );

            let mut accessories = server.accessories.lock().unwrap();
            let c = find_characteristic(&mut accessories, 2, 5).unwrap();
            assert!(c.events.is_empty());
        }

        #[test]
        fn null_value_is_treated_as_absent() {
            let server = server_with_session(ADDR);
            let resp = put(
                &server,
                ADDR,
                json!({"characteristics": [{"aid": 2, "iid": 9, "value": null}]}),
            );
            assert_eq!(resp.status, 204);
            let mut accessories = server.accessories.lock().unwrap();
            let c = find_characteristic(&mut accessories, 2, 9).unwrap();
            assert_eq!(c.value(), &json!(false));
        }

        #[test]
        fn bad_json_is_invalid_value() {
            let server = server_with_session(ADDR);
            let resp = server.put_characteristics(ADDR, b"{not json");
            assert_eq!(resp.status, 400);
            assert!(String::from_utf8(resp.body).unwrap().contains("-70410"));
        }
    }
}
