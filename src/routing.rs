//! Broker addressing derived from device properties.
//!
//! Two pure functions live here: device properties → the routing key that
//! steers a task to the right worker pool, and testrun id → the name of the
//! response queue workers publish back to.
//!
//! # Addressing Scheme
//!
//! | Input | Output |
//! |-------|--------|
//! | `{devicegroup: "g1"}` | routing key `g1` |
//! | `{devicegroup: "g1", devicename: "n1"}` | routing key `g1.n1` |
//! | `{devicegroup: "g1", devicename: "n1", deviceid: "d1"}` | routing key `g1.n1.d1` |
//! | testrun id `42` | response queue `r42` |
//!
//! Worker pools consume from a queue named exactly by the routing key they
//! serve, so the key doubles as the dispatch queue name.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Mandatory device property selecting the worker pool.
pub const PROP_DEVICEGROUP: &str = "devicegroup";

/// Optional device property narrowing to one named device.
pub const PROP_DEVICENAME: &str = "devicename";

/// Optional device property pinning one physical unit.
pub const PROP_DEVICEID: &str = "deviceid";

/// Recognized property keys in precedence order.
const RECOGNIZED: [&str; 3] = [PROP_DEVICEGROUP, PROP_DEVICENAME, PROP_DEVICEID];

/// Prefix of every response queue name.
const QUEUE_PREFIX: &str = "r";

/// Errors raised while deriving a routing key.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidPropertiesError {
    /// The mandatory `devicegroup` property was not supplied.
    #[error("missing mandatory device property '{PROP_DEVICEGROUP}'")]
    MissingGroup,

    /// A property key outside the recognized set was supplied.
    #[error("unrecognized device property '{0}'")]
    UnrecognizedKey(String),
}

/// A broker routing key derived from device properties.
///
/// Components are joined with `.` in fixed precedence order:
/// `devicegroup[.devicename[.deviceid]]`. An optional component is only
/// appended when present; a later component never appears without the
/// earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Derives a routing key from device properties.
    ///
    /// # Errors
    ///
    /// [`InvalidPropertiesError`] if `devicegroup` is absent or any key is
    /// not one of `devicegroup`, `devicename`, `deviceid`. Callers must not
    /// dispatch on error.
    pub fn from_properties(
        properties: &BTreeMap<String, String>,
    ) -> Result<Self, InvalidPropertiesError> {
        for key in properties.keys() {
            if !RECOGNIZED.contains(&key.as_str()) {
                return Err(InvalidPropertiesError::UnrecognizedKey(key.clone()));
            }
        }

        let group = properties
            .get(PROP_DEVICEGROUP)
            .ok_or(InvalidPropertiesError::MissingGroup)?;

        let mut components = vec![group.as_str()];
        if let Some(name) = properties.get(PROP_DEVICENAME) {
            components.push(name);
            if let Some(id) = properties.get(PROP_DEVICEID) {
                components.push(id);
            }
        } else if let Some(id) = properties.get(PROP_DEVICEID) {
            // No devicename to slot between group and id; the id still
            // keeps its fixed position at the end.
            components.push(id);
        }

        Ok(Self(components.join(".")))
    }

    /// The routing key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the response queue name for a testrun.
///
/// Pure function of the testrun id: `"r" + testrun_id`. Distinct testrun ids
/// therefore never collide for the lifetime of either.
///
/// # Example
///
/// ```
/// assert_eq!(farmout::routing::response_queue("42"), "r42");
/// ```
pub fn response_queue(testrun_id: &str) -> String {
    format!("{QUEUE_PREFIX}{testrun_id}")
}
