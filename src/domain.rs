//! Domain types shared across the portal core.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;
use zbus::zvariant::{OwnedValue, Value};

/// Response code for a successfully completed request.
pub const RESPONSE_SUCCESS: u32 = 0;

/// Response code for any failure (backend error, permission denial).
///
/// Backend-internal diagnostics are logged, never surfaced through this code.
pub const RESPONSE_OTHER: u32 = 2;

/// Results key carrying the idle time in milliseconds on a successful response.
pub const RESULT_IDLE_TIME: &str = "idleTime";

/// A value in a request/response payload.
///
/// Closed equivalent of the D-Bus `a{sv}` entries this daemon actually
/// carries: strings, unsigned integers, booleans, and nested mappings.
/// Anything else arriving on the wire is dropped at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Str(String),
    U32(u32),
    U64(u64),
    Bool(bool),
    Map(VarMap),
}

/// Typed key-value payload used for call options and response results.
pub type VarMap = HashMap<String, Variant>;

impl Variant {
    /// Convert to a zbus value for wire serialization.
    pub fn to_value(&self) -> Value<'static> {
        match self {
            Self::Str(s) => Value::from(s.clone()),
            Self::U32(v) => Value::from(*v),
            Self::U64(v) => Value::from(*v),
            Self::Bool(b) => Value::from(*b),
            Self::Map(m) => Value::from(varmap_to_wire(m)),
        }
    }

    /// Read the value as a u32 if it holds one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }
}

/// Convert a payload to its wire representation.
pub fn varmap_to_wire(map: &VarMap) -> HashMap<String, Value<'static>> {
    map.iter().map(|(k, v)| (k.clone(), v.to_value())).collect()
}

/// Convert an inbound `a{sv}` payload to the closed variant type.
///
/// Entries that do not fit the closed type are dropped with a trace log;
/// the daemon never forwards values it cannot represent.
pub fn varmap_from_wire(map: HashMap<String, OwnedValue>) -> VarMap {
    map.into_iter()
        .filter_map(|(key, value)| match variant_from_wire(value) {
            Some(v) => Some((key, v)),
            None => {
                trace!("Dropping unrepresentable payload entry: {}", key);
                None
            }
        })
        .collect()
}

fn variant_from_wire(value: OwnedValue) -> Option<Variant> {
    if let Ok(v) = value.downcast_ref::<u32>() {
        return Some(Variant::U32(v));
    }
    if let Ok(v) = value.downcast_ref::<u64>() {
        return Some(Variant::U64(v));
    }
    if let Ok(v) = value.downcast_ref::<bool>() {
        return Some(Variant::Bool(v));
    }
    if let Ok(v) = value.downcast_ref::<&str>() {
        return Some(Variant::Str(v.to_owned()));
    }
    if let Ok(nested) = <HashMap<String, OwnedValue>>::try_from(value) {
        return Some(Variant::Map(varmap_from_wire(nested)));
    }
    None
}

/// Stable application identity used to key permission decisions.
///
/// Sandboxed callers carry a real app id; host callers fall back to an id
/// derived from their unique bus connection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppId(String);

impl AppId {
    /// Create an app id from a known identity string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive an app id from a caller's unique bus connection name.
    pub fn from_connection_name(name: &str) -> Self {
        Self(escape_connection_name(name))
    }

    /// Get the app id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Escape a bus connection name (e.g. `:1.42`) into an object-path-safe
/// token (`1_42`), the portal convention for request handles.
pub fn escape_connection_name(name: &str) -> String {
    name.trim_start_matches(':')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
