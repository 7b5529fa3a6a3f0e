//! Event notification fan-out.
//!
//! When a characteristic value changes, every connection whose address has
//! events enabled for it receives an asynchronous `EVENT/1.0` message with
//! the same JSON shape as a read response. Delivery is best-effort per
//! connection; the connection task closes its socket if the write fails.

use std::collections::HashMap;

use hap_core::accessory::find_characteristic;
use hap_core::error::{Error, Result};
use serde_json::Value;
use tracing::debug;

use crate::characteristics::{payload_bytes, CharacteristicData};
use crate::http::event_message;
use crate::server::Server;

impl Server {
    /// Owner-driven value change: store the value and notify every
    /// subscriber. Controller writes go through the PUT handler instead,
    /// which excludes the writing connection.
    pub fn set_characteristic_value(&self, aid: u64, iid: u64, value: Value) -> Result<()> {
        {
            let mut accessories = self.accessories.lock().expect("accessory mutex poisoned");
            let c = find_characteristic(&mut accessories, aid, iid)
                .ok_or(Error::CharacteristicNotFound { aid, iid })?;
            // Owner writes bypass permission checks.
            let _ = c.set_value_request(value, None);
        }
        self.notify_change(&[(aid, iid)], None);
        Ok(())
    }

    /// Fan out the current values of the changed characteristics to every
    /// subscribed connection, except `exclude` (the writer, for
    /// controller-driven changes).
    pub(crate) fn notify_change(&self, changed: &[(u64, u64)], exclude: Option<&str>) {
        if changed.is_empty() {
            return;
        }

        let mut per_addr: HashMap<String, Vec<CharacteristicData>> = HashMap::new();
        {
            let mut accessories = self.accessories.lock().expect("accessory mutex poisoned");
            for &(aid, iid) in changed {
                let Some(c) = find_characteristic(&mut accessories, aid, iid) else {
                    continue;
                };
                let value = c.value().clone();
                for (subscriber, enabled) in &c.events {
                    if !enabled || exclude == Some(subscriber.as_str()) {
                        continue;
                    }
                    per_addr
                        .entry(subscriber.clone())
                        .or_default()
                        .push(CharacteristicData {
                            aid,
                            iid,
                            value: Some(value.clone()),
                            ..Default::default()
                        });
                }
            }
        }

        for (addr, items) in per_addr {
            let Some(conn) = self.registry.conn(&addr) else {
                continue;
            };
            debug!(%addr, count = items.len(), "sending event notification");
            conn.send_event(event_message(&payload_bytes(items)));
        }
    }
}
