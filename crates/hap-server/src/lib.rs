//! # hap-server
//!
//! The accessory-side HAP server core: HTTP/1.1 parsing and routing, the
//! pairing endpoints, the session/connection registry, the post-verify
//! encrypted transport, pairings administration, the characteristic access
//! protocol and event notification fan-out.

mod characteristics;
mod event;
mod pair_setup;
mod pair_verify;
mod pairings;

pub mod http;
pub mod registry;
pub mod server;
pub mod session;

pub use characteristics::CharacteristicData;
pub use registry::{ConnCommand, ConnHandle, Registry, SessionState};
pub use server::Server;
pub use session::Session;
