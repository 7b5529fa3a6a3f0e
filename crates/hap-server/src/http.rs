//! Minimal HTTP/1.1 wire layer.
//!
//! Controllers speak plain HTTP/1.1 on a persistent connection; after
//! pair-verify the same byte stream carries whole HTTP messages inside the
//! encrypted framing, so requests are parsed from complete buffers.

use std::collections::HashMap;

use hap_core::error::ParseError;
use hap_crypto::tlv::Tlv8;

pub const CONTENT_TYPE_TLV8: &str = "application/pairing+tlv8";
pub const CONTENT_TYPE_HAP_JSON: &str = "application/hap+json";

/// A parsed HTTP request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse one complete request from a buffer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header_end = find_header_end(data).ok_or_else(|| {
            ParseError::InvalidFormat("HTTP: missing header terminator".to_string())
        })?;
        let head = std::str::from_utf8(&data[..header_end])
            .map_err(|_| ParseError::InvalidFormat("HTTP: headers are not UTF-8".to_string()))?;

        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or(ParseError::MissingField("request line"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or(ParseError::MissingField("method"))?
            .to_string();
        let target = parts.next().ok_or(ParseError::MissingField("target"))?;

        let (path, query) = match target.split_once('?') {
            Some((path, query_str)) => (path.to_string(), parse_query(query_str)),
            None => (target.to_string(), HashMap::new()),
        };

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let body_start = header_end + 4;
        if data.len() < body_start + content_length {
            return Err(ParseError::InvalidFormat(
                "HTTP: body shorter than Content-Length".to_string(),
            ));
        }
        let body = data[body_start..body_start + content_length].to_vec();

        Ok(Self {
            method,
            path,
            query,
            headers,
            body,
        })
    }

    /// Boolean query flag: present and equal to "1".
    pub fn query_flag(&self, name: &str) -> bool {
        self.query.get(name).map(|v| v == "1").unwrap_or(false)
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some((key, value)) => map.insert(key.to_string(), value.to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}

/// An HTTP response to serialize onto the wire.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    /// TLV8 body with the pairing content type.
    pub fn tlv(status: u16, tlv: Tlv8) -> Self {
        Self {
            status,
            content_type: Some(CONTENT_TYPE_TLV8),
            body: tlv.encode(),
        }
    }

    /// Raw TLV8 bytes (used where records repeat and the map type cannot
    /// express the payload).
    pub fn tlv_bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: Some(CONTENT_TYPE_TLV8),
            body,
        }
    }

    /// JSON body with the hap content type.
    pub fn json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: Some(CONTENT_TYPE_HAP_JSON),
            body,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status,
            status_text(self.status)
        )
        .into_bytes();
        if let Some(content_type) = self.content_type {
            out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        207 => "Multi-Status",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// Serialize an asynchronous event notification.
///
/// Events use their own start line so controllers can tell them apart from
/// pipelined responses.
pub fn event_message(body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "EVENT/1.0 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        CONTENT_TYPE_HAP_JSON,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_crypto::tlv::TlvType;

    mod request {
        use super::*;

        #[test]
        fn parses_get_with_query() {
            let raw = b"GET /characteristics?id=1.9,2.10&meta=1 HTTP/1.1\r\nHost: hap\r\n\r\n";
            let req = Request::parse(raw).unwrap();
            assert_eq!(req.method, "GET");
            assert_eq!(req.path, "/characteristics");
            assert_eq!(req.query.get("id").unwrap(), "1.9,2.10");
            assert!(req.query_flag("meta"));
            assert!(!req.query_flag("perms"));
        }

        #[test]
        fn parses_post_with_body() {
            let raw =
                b"POST /pair-setup HTTP/1.1\r\nContent-Type: application/pairing+tlv8\r\nContent-Length: 3\r\n\r\n\x06\x01\x01";
            let req = Request::parse(raw).unwrap();
            assert_eq!(req.method, "POST");
            assert_eq!(req.path, "/pair-setup");
            assert_eq!(req.body, vec![0x06, 0x01, 0x01]);
            assert_eq!(
                req.headers.get("content-type").unwrap(),
                "application/pairing+tlv8"
            );
        }

        #[test]
        fn rejects_truncated_body() {
            let raw = b"PUT /characteristics HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort";
            assert!(Request::parse(raw).is_err());
        }

        #[test]
        fn rejects_missing_header_terminator() {
            assert!(Request::parse(b"GET / HTTP/1.1\r\nHost: hap\r\n").is_err());
        }
    }

    mod response {
        use super::*;

        #[test]
        fn serializes_status_line_and_length() {
            let resp = Response::json(207, b"{}".to_vec());
            let wire = String::from_utf8(resp.serialize()).unwrap();
            assert!(wire.starts_with("HTTP/1.1 207 Multi-Status\r\n"));
            assert!(wire.contains("Content-Type: application/hap+json\r\n"));
            assert!(wire.contains("Content-Length: 2\r\n"));
            assert!(wire.ends_with("\r\n\r\n{}"));
        }

        #[test]
        fn no_content_has_empty_body() {
            let wire = String::from_utf8(Response::new(204).serialize()).unwrap();
            assert!(wire.starts_with("HTTP/1.1 204 No Content\r\n"));
            assert!(wire.ends_with("Content-Length: 0\r\n\r\n"));
        }

        #[test]
        fn tlv_response_roundtrips() {
            let mut tlv = Tlv8::new();
            tlv.set_byte(TlvType::State, 0x02);
            let resp = Response::tlv(200, tlv);
            assert_eq!(resp.body, vec![0x06, 0x01, 0x02]);
        }
    }

    #[test]
    fn event_message_uses_event_start_line() {
        let wire = String::from_utf8(event_message(b"{\"characteristics\":[]}")).unwrap();
        assert!(wire.starts_with("EVENT/1.0 200 OK\r\n"));
        assert!(wire.contains("Content-Type: application/hap+json\r\n"));
        assert!(wire.ends_with("{\"characteristics\":[]}"));
    }
}
