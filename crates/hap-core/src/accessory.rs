//! Accessory object model: accessories, services, characteristics.
//!
//! The server only needs the lookup and value-access contracts: resolving a
//! characteristic by `(aid, iid)`, reading and writing its JSON value through
//! optional hooks, and the per-controller event subscription map.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::json_status;

/// Context handed to characteristic hooks for a controller-driven access.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Remote address of the controller connection.
    pub remote_addr: String,
}

/// Read hook: may return a fresh value sampled on demand.
pub type ReadHook = Box<dyn Fn(&RequestContext) -> Option<Value> + Send>;
/// Write hook: observes controller writes.
pub type WriteHook = Box<dyn Fn(&Value, Option<&RequestContext>) + Send>;

/// Permission strings used in the JSON projection.
pub mod perm {
    pub const READ: &str = "pr";
    pub const WRITE: &str = "pw";
    pub const EVENTS: &str = "ev";
}

/// Well-known HAP type tags used by the built-in services.
pub mod type_tag {
    pub const ACCESSORY_INFORMATION: &str = "3E";
    pub const IDENTIFY: &str = "14";
    pub const MANUFACTURER: &str = "20";
    pub const MODEL: &str = "21";
    pub const NAME: &str = "23";
    pub const SERIAL_NUMBER: &str = "30";
    pub const FIRMWARE_REVISION: &str = "52";
    pub const LIGHTBULB: &str = "43";
    pub const ON: &str = "25";
    pub const BRIGHTNESS: &str = "8";
}

/// An addressable attribute with format, permissions and subscriptions.
pub struct Characteristic {
    /// Instance id, unique within the owning accessory. Assigned when the
    /// service is added to an accessory.
    pub iid: u64,
    pub type_tag: String,
    pub format: String,
    pub unit: String,
    pub permissions: Vec<String>,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
    pub min_step: Option<Value>,
    /// Projected only when greater than zero.
    pub max_len: i32,
    value: Value,
    /// Event subscription per controller, keyed by remote address.
    pub events: HashMap<String, bool>,
    on_read: Option<ReadHook>,
    on_write: Option<WriteHook>,
}

impl Characteristic {
    pub fn new(type_tag: &str, format: &str, permissions: &[&str]) -> Self {
        Self {
            iid: 0,
            type_tag: type_tag.to_string(),
            format: format.to_string(),
            unit: String::new(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            min_value: None,
            max_value: None,
            min_step: None,
            max_len: 0,
            value: Value::Null,
            events: HashMap::new(),
            on_read: None,
            on_write: None,
        }
    }

    /// Read-only string characteristic.
    pub fn string(type_tag: &str, value: &str) -> Self {
        let mut c = Self::new(type_tag, "string", &[perm::READ]);
        c.value = Value::String(value.to_string());
        c
    }

    /// Observable read/write boolean characteristic.
    pub fn bool(type_tag: &str, value: bool) -> Self {
        let mut c = Self::new(type_tag, "bool", &[perm::READ, perm::WRITE, perm::EVENTS]);
        c.value = Value::Bool(value);
        c
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn with_range(mut self, min: Value, max: Value, step: Value) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self.min_step = Some(step);
        self
    }

    pub fn with_max_len(mut self, max_len: i32) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    pub fn on_read(mut self, hook: ReadHook) -> Self {
        self.on_read = Some(hook);
        self
    }

    pub fn on_write(mut self, hook: WriteHook) -> Self {
        self.on_write = Some(hook);
        self
    }

    pub fn is_readable(&self) -> bool {
        self.permissions.iter().any(|p| p == perm::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.permissions.iter().any(|p| p == perm::WRITE)
    }

    pub fn is_observable(&self) -> bool {
        self.permissions.iter().any(|p| p == perm::EVENTS)
    }

    /// Current value without hook involvement.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Value as seen by a controller request. The read hook may sample a
    /// fresh value, which also becomes the stored one.
    pub fn value_request(&mut self, ctx: &RequestContext) -> Value {
        if let Some(hook) = &self.on_read {
            if let Some(fresh) = hook(ctx) {
                self.value = fresh;
            }
        }
        self.value.clone()
    }

    /// Write a value. Controller writes (`ctx` present) to a characteristic
    /// without write permission are rejected; owner writes always land.
    pub fn set_value_request(
        &mut self,
        value: Value,
        ctx: Option<&RequestContext>,
    ) -> Result<(), i32> {
        if ctx.is_some() && !self.is_writable() {
            return Err(json_status::INVALID_VALUE_IN_REQUEST);
        }
        if let Some(hook) = &self.on_write {
            hook(&value, ctx);
        }
        self.value = value;
        Ok(())
    }

    /// Update the event flag for one controller address.
    pub fn set_event_subscription(&mut self, addr: &str, enabled: bool) {
        self.events.insert(addr.to_string(), enabled);
    }

    /// Event flag for one controller address; unset means false.
    pub fn event_subscription(&self, addr: &str) -> bool {
        self.events.get(addr).copied().unwrap_or(false)
    }
}

/// A group of characteristics with a service type tag.
pub struct Service {
    pub iid: u64,
    pub type_tag: String,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(type_tag: &str) -> Self {
        Self {
            iid: 0,
            type_tag: type_tag.to_string(),
            characteristics: Vec::new(),
        }
    }

    pub fn add_characteristic(mut self, c: Characteristic) -> Self {
        self.characteristics.push(c);
        self
    }
}

/// The device being controlled, or one accessory behind a bridge.
pub struct Accessory {
    pub id: u64,
    next_iid: u64,
    pub services: Vec<Service>,
}

impl Accessory {
    /// Create an accessory with the mandatory AccessoryInformation service.
    pub fn new(id: u64, name: &str, manufacturer: &str, model: &str, serial: &str) -> Self {
        let mut a = Self {
            id,
            next_iid: 1,
            services: Vec::new(),
        };
        let info = Service::new(type_tag::ACCESSORY_INFORMATION)
            .add_characteristic(Characteristic::new(
                type_tag::IDENTIFY,
                "bool",
                &[perm::WRITE],
            ))
            .add_characteristic(Characteristic::string(type_tag::MANUFACTURER, manufacturer))
            .add_characteristic(Characteristic::string(type_tag::MODEL, model))
            .add_characteristic(Characteristic::string(type_tag::NAME, name))
            .add_characteristic(Characteristic::string(type_tag::SERIAL_NUMBER, serial))
            .add_characteristic(Characteristic::string(type_tag::FIRMWARE_REVISION, "1.0.0"));
        a.add_service(info);
        a
    }

    /// Add a service, assigning instance ids to it and its characteristics.
    pub fn add_service(&mut self, mut service: Service) {
        service.iid = self.next_iid;
        self.next_iid += 1;
        for c in &mut service.characteristics {
            c.iid = self.next_iid;
            self.next_iid += 1;
        }
        self.services.push(service);
    }

    pub fn find_characteristic(&mut self, iid: u64) -> Option<&mut Characteristic> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.iid == iid)
    }

    /// First characteristic with the given type tag, if any.
    pub fn characteristic_by_type(&mut self, type_tag: &str) -> Option<&mut Characteristic> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.type_tag == type_tag)
    }
}

/// Resolve a characteristic across the primary and bridged accessories.
/// First match wins; iids are unique within an accessory.
pub fn find_characteristic(
    accessories: &mut [Accessory],
    aid: u64,
    iid: u64,
) -> Option<&mut Characteristic> {
    accessories
        .iter_mut()
        .find(|a| a.id == aid)
        .and_then(|a| a.find_characteristic(iid))
}
