//! # hap-core
//!
//! Core types shared by the HomeKit accessory server crates:
//! - error taxonomy
//! - the persistent key/value store contract and its implementations
//! - the accessory object model (accessories, services, characteristics)

pub mod accessory;
pub mod error;
pub mod store;

pub use accessory::{Accessory, Characteristic, RequestContext, Service};
pub use error::{Error, Result};
pub use store::{FsStore, MemStore, Store, Storer};
