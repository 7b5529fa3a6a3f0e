//! The accessory server: identity bootstrap, route dispatch, connection loop.

use std::sync::{Arc, Mutex};

use hap_core::accessory::Accessory;
use hap_core::error::{ParseError, Result};
use hap_core::store::{KeyPair, Store, Storer};
use hap_crypto::ed25519::DeviceKeyPair;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::{Request, Response};
use crate::registry::{ConnCommand, ConnHandle, Registry};
use crate::session::Session;

/// Maximum plaintext bytes per encrypted chunk, from the framing protocol.
const MAX_CHUNK_LEN: usize = hap_crypto::chacha::MAX_CHUNK_LEN;

/// A HomeKit accessory server over one TCP listener.
///
/// Owns the registry, the store, the long-term identity and the accessory
/// set; one instance serves the primary accessory and any bridged ones.
pub struct Server {
    pub(crate) storer: Storer,
    pub(crate) key: DeviceKeyPair,
    pub(crate) device_id: String,
    pub(crate) pin: String,
    pub(crate) accessories: Mutex<Vec<Accessory>>,
    pub(crate) registry: Registry,
}

impl Server {
    /// Build a server over a store and accessory set.
    ///
    /// Generates and persists the long-term Ed25519 key pair and the device
    /// identifier on first boot; later boots reload them.
    pub fn new(store: impl Store + 'static, accessories: Vec<Accessory>, pin: &str) -> Result<Self> {
        let storer = Storer::new(store);
        storer.ensure_schema()?;

        let key = match storer.key_pair() {
            Ok(kp) => DeviceKeyPair::from_secret(&kp.private)?,
            Err(_) => {
                let key = DeviceKeyPair::generate();
                storer.save_key_pair(&KeyPair {
                    public: key.public_key().to_vec(),
                    private: key.secret_bytes().to_vec(),
                })?;
                info!("generated accessory key pair");
                key
            }
        };

        let device_id = match storer.device_id() {
            Ok(id) => id,
            Err(_) => {
                let id = uuid::Uuid::new_v4().to_string().to_uppercase();
                storer.save_device_id(&id)?;
                id
            }
        };

        Ok(Self {
            storer,
            key,
            device_id,
            pin: fmt_pin(pin)?,
            accessories: Mutex::new(accessories),
            registry: Registry::new(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Route one request to its handler.
    pub fn handle(&self, addr: &str, req: &Request) -> Response {
        debug!(%addr, method = %req.method, path = %req.path, "request");
        match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/pair-setup") => self.pair_setup(addr, &req.body),
            ("POST", "/pair-verify") => self.pair_verify(addr, &req.body),
            ("POST", "/pairings") => self.pairings(addr, &req.body),
            ("GET", "/characteristics") => self.get_characteristics(addr, req),
            ("PUT", "/characteristics") => self.put_characteristics(addr, &req.body),
            _ => Response::new(404),
        }
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "accessory listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(stream, addr.to_string()).await;
            });
        }
    }

    /// Serve one connection until it closes, errors, or is torn down.
    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: String) {
        debug!(%addr, "connection accepted");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.registry.set_conn(&addr, ConnHandle::new(tx));

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(ConnCommand::Event(message)) => {
                        // Events only flow to verified controllers; missing
                        // session means the subscription is already stale.
                        let Some(session) = self.registry.established(&addr) else {
                            continue;
                        };
                        if write_message(&mut write_half, &message, Some(&session))
                            .await
                            .is_err()
                        {
                            warn!(%addr, "event write failed, closing connection");
                            break;
                        }
                    }
                    Some(ConnCommand::Close) | None => {
                        debug!(%addr, "connection close requested");
                        break;
                    }
                },
                readable = reader.fill_buf() => {
                    match readable {
                        Ok(buf) if buf.is_empty() => break, // EOF
                        Ok(_) => {}
                        Err(e) => {
                            debug!(%addr, error = %e, "read error");
                            break;
                        }
                    }

                    // The session in force when the request arrives also
                    // encrypts the response; verify installs the session for
                    // the *next* message, so its final reply goes out clear.
                    let session = self.registry.established(&addr);
                    let message = match read_message(&mut reader, session.as_ref()).await {
                        Ok(Some(bytes)) => bytes,
                        Ok(None) => break,
                        Err(e) => {
                            // Stream-level AEAD failure is fatal.
                            warn!(%addr, error = %e, "transport failure, closing connection");
                            break;
                        }
                    };

                    let response = match Request::parse(&message) {
                        Ok(request) => self.handle(&addr, &request),
                        Err(e) => {
                            debug!(%addr, error = %e, "bad request");
                            Response::new(400)
                        }
                    };

                    if write_message(&mut write_half, &response.serialize(), session.as_ref())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }

        let _ = write_half.shutdown().await;
        self.registry.connection_closed(&addr);
    }
}

/// Format the out-of-band PIN as `XXX-XX-XXX`, the form the SRP password
/// uses on both ends.
fn fmt_pin(pin: &str) -> Result<String> {
    let digits: String = pin.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 8 {
        return Err(ParseError::InvalidValue(format!(
            "PIN must contain 8 digits, got {}",
            digits.len()
        ))
        .into());
    }
    Ok(format!(
        "{}-{}-{}",
        &digits[0..3],
        &digits[3..5],
        &digits[5..8]
    ))
}

/// Read one complete HTTP message from the wire.
///
/// Plaintext mode reads headers and honours Content-Length; encrypted mode
/// reads framed chunks until a terminal chunk shorter than 0x400 arrives.
/// Returns `Ok(None)` on a clean EOF at a message boundary.
async fn read_message(
    reader: &mut BufReader<OwnedReadHalf>,
    session: Option<&Arc<Mutex<Session>>>,
) -> std::io::Result<Option<Vec<u8>>> {
    match session {
        Some(session) => read_encrypted_message(reader, session).await,
        None => read_plain_message(reader).await,
    }
}

async fn read_plain_message(
    reader: &mut BufReader<OwnedReadHalf>,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut head = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        head.extend_from_slice(line.as_bytes());
        if line == "\r\n" {
            break;
        }
    }

    let content_length = std::str::from_utf8(&head)
        .ok()
        .and_then(|s| {
            s.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
        })
        .unwrap_or(0);

    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        head.extend_from_slice(&body);
    }
    Ok(Some(head))
}

async fn read_encrypted_message(
    reader: &mut BufReader<OwnedReadHalf>,
    session: &Arc<Mutex<Session>>,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut plaintext = Vec::new();
    loop {
        let mut len_bytes = [0u8; 2];
        match reader.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && plaintext.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        let chunk_len = u16::from_le_bytes(len_bytes);

        let mut chunk = vec![0u8; chunk_len as usize + 16];
        reader.read_exact(&mut chunk).await?;

        let decrypted = session
            .lock()
            .expect("session mutex poisoned")
            .decrypt_chunk(&chunk, chunk_len)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        plaintext.extend_from_slice(&decrypted);

        if (chunk_len as usize) < MAX_CHUNK_LEN {
            break;
        }
    }
    Ok(Some(plaintext))
}

/// Write one complete message, encrypting when a session is in force.
async fn write_message(
    writer: &mut OwnedWriteHalf,
    message: &[u8],
    session: Option<&Arc<Mutex<Session>>>,
) -> std::io::Result<()> {
    let wire = match session {
        Some(session) => session
            .lock()
            .expect("session mutex poisoned")
            .encrypt(message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?,
        None => message.to_vec(),
    };
    writer.write_all(&wire).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_core::store::MemStore;

    #[test]
    fn fmt_pin_normalises_separators() {
        assert_eq!(fmt_pin("031-45-154").unwrap(), "031-45-154");
        assert_eq!(fmt_pin("03145154").unwrap(), "031-45-154");
        assert!(fmt_pin("1234").is_err());
        assert!(fmt_pin("123456789").is_err());
    }

    #[test]
    fn identity_persists_across_boots() {
        let store = Arc::new(MemStore::new());

        struct Shared(Arc<MemStore>);
        impl hap_core::store::Store for Shared {
            fn set(&self, key: &str, value: &[u8]) -> hap_core::error::Result<()> {
                self.0.set(key, value)
            }
            fn get(&self, key: &str) -> hap_core::error::Result<Vec<u8>> {
                self.0.get(key)
            }
            fn delete(&self, key: &str) -> hap_core::error::Result<()> {
                self.0.delete(key)
            }
            fn keys_with_suffix(&self, suffix: &str) -> hap_core::error::Result<Vec<String>> {
                self.0.keys_with_suffix(suffix)
            }
        }

        let first = Server::new(Shared(Arc::clone(&store)), Vec::new(), "031-45-154").unwrap();
        let public = first.key.public_key();
        let device_id = first.device_id().to_string();
        drop(first);

        let second = Server::new(Shared(store), Vec::new(), "031-45-154").unwrap();
        assert_eq!(second.key.public_key(), public);
        assert_eq!(second.device_id(), device_id);
    }

    #[test]
    fn unknown_route_is_404() {
        let server = Server::new(MemStore::new(), Vec::new(), "031-45-154").unwrap();
        let req = Request::parse(b"GET /accessories-list HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(server.handle("10.0.0.2:1", &req).status, 404);
    }
}
