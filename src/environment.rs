//! Execution environments for test packages.
//!
//! An [`Environment`] names the context a test package runs in: a hardware
//! device, a host process controlling one, or a scratchbox. The name is the
//! identity; the host/hardware flags are derived predicates used when the
//! task set is built.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix that marks host-side execution environments.
const HOST_PREFIX: &str = "host";

/// Substring that marks hardware-backed environments.
const HW_MARKER: &str = "hardware";

/// The execution context for a test package.
///
/// Equality and hashing are by raw name only. The derived flags can overlap:
/// `host.hardware` is both a host environment and a hardware one.
///
/// # Example
///
/// ```
/// use farmout::environment::Environment;
///
/// let env = Environment::new("host.hardware");
/// assert!(env.is_host());
/// assert!(env.is_hw());
///
/// let device = Environment::new("device");
/// assert!(!device.is_host());
/// assert!(!device.is_hw());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment {
    name: String,
}

impl Environment {
    /// Creates an environment from its raw name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The raw environment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` for host-side environments (`host`, `host.foo`, ...).
    pub fn is_host(&self) -> bool {
        self.name == HOST_PREFIX || self.name.starts_with(&format!("{HOST_PREFIX}."))
    }

    /// Returns `true` for environments backed by real hardware.
    pub fn is_hw(&self) -> bool {
        self.name.contains(HW_MARKER)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Environment {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_detection() {
        assert!(Environment::new("host.foo").is_host());
        assert!(Environment::new("host").is_host());
        assert!(!Environment::new("foo").is_host());
        assert!(!Environment::new("hostile").is_host());
    }

    #[test]
    fn test_hw_detection() {
        assert!(Environment::new("hardware").is_hw());
        assert!(Environment::new("host.hardware").is_hw());
        assert!(!Environment::new("device").is_hw());
    }

    #[test]
    fn test_overlapping_flags() {
        let env = Environment::new("host.hardware");
        assert!(env.is_host());
        assert!(env.is_hw());
    }

    #[test]
    fn test_identity_by_name() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Environment::new("hardware"));
        assert!(set.contains(&Environment::new("hardware")));
        assert!(!set.contains(&Environment::new("host.hardware")));
    }
}
