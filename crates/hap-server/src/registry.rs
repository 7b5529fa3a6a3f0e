//! Session and connection registry.
//!
//! One mapping per server instance: remote-addr to session state (setup,
//! verify, or established) and remote-addr to connection handle. Both maps
//! sit behind a single mutex; the connection task removes its entries when
//! the transport closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hap_pairing::{PairSetupSession, PairVerifySession};
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::Session;

/// The three shapes a remote address can hold while talking to us.
pub enum SessionState {
    Setup(PairSetupSession),
    Verify(PairVerifySession),
    /// Post-verify. Shared with the connection task, which locks it for
    /// every encrypt/decrypt so wire order matches counter order.
    Established(Arc<Mutex<Session>>),
}

/// Commands delivered to a connection task from elsewhere in the server.
pub enum ConnCommand {
    /// A plaintext EVENT message to encrypt and write.
    Event(Vec<u8>),
    /// Tear the connection down.
    Close,
}

/// Cloneable handle to a live connection's command channel.
#[derive(Clone)]
pub struct ConnHandle {
    tx: mpsc::UnboundedSender<ConnCommand>,
}

impl ConnHandle {
    pub fn new(tx: mpsc::UnboundedSender<ConnCommand>) -> Self {
        Self { tx }
    }

    /// Queue an event message; returns false if the connection is gone.
    pub fn send_event(&self, message: Vec<u8>) -> bool {
        self.tx.send(ConnCommand::Event(message)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(ConnCommand::Close);
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionState>,
    conns: HashMap<String, ConnHandle>,
}

/// Process-wide in the original design; here owned by the server object and
/// handed to every handler. The contract is identical.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_session(&self, addr: &str, state: SessionState) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.sessions.insert(addr.to_string(), state);
    }

    /// Remove and return whatever session state the address holds. Setup and
    /// verify handlers take the state out, advance it, and put it back only
    /// on success, so any failure leaves the address empty.
    pub fn take_session(&self, addr: &str) -> Option<SessionState> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.sessions.remove(addr)
    }

    pub fn remove_session(&self, addr: &str) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.sessions.remove(addr);
    }

    /// The established session for an address, if pair-verify completed.
    pub fn established(&self, addr: &str) -> Option<Arc<Mutex<Session>>> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        match inner.sessions.get(addr) {
            Some(SessionState::Established(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Pair-setup is single-occupancy: any other address holding any session
    /// state blocks a new setup. A same-address retry is allowed and simply
    /// overwrites the previous state.
    pub fn another_addr_has_session(&self, addr: &str) -> bool {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.sessions.keys().any(|a| a != addr)
    }

    pub fn set_conn(&self, addr: &str, handle: ConnHandle) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.conns.insert(addr.to_string(), handle);
    }

    pub fn conn(&self, addr: &str) -> Option<ConnHandle> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.conns.get(addr).cloned()
    }

    /// Snapshot of all live connections.
    pub fn conns(&self) -> Vec<(String, ConnHandle)> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .conns
            .iter()
            .map(|(a, h)| (a.clone(), h.clone()))
            .collect()
    }

    /// Pairing name owning the established session at an address.
    pub fn session_pairing_name(&self, addr: &str) -> Option<String> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        match inner.sessions.get(addr) {
            Some(SessionState::Established(session)) => Some(
                session
                    .lock()
                    .expect("session mutex poisoned")
                    .pairing
                    .name
                    .clone(),
            ),
            _ => None,
        }
    }

    /// Connection lifecycle callback: drop both entries for the address.
    pub fn connection_closed(&self, addr: &str) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.sessions.remove(addr);
        inner.conns.remove(addr);
        debug!(%addr, "connection closed, registry entries removed");
    }
}
