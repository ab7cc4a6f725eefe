//! Protocol versioning for Rapport.
//!
//! Clients announce their version in `Connect`; a differing major version is
//! refused.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// The version both sides speak: the lower of the two minors.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedVersion` if the majors differ.
    pub fn negotiate(self, client: Version) -> Result<Version, ProtocolError> {
        if !self.is_compatible_with(&client) {
            return Err(ProtocolError::UnsupportedVersion(client));
        }
        Ok(self.min(client))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v1_0 = Version::new(1, 0);
        let v1_1 = Version::new(1, 1);
        let v2_0 = Version::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_1));
        assert!(!v1_0.is_compatible_with(&v2_0));
    }

    #[test]
    fn test_negotiate() {
        let server = Version::new(1, 2);
        assert_eq!(server.negotiate(Version::new(1, 0)).unwrap(), Version::new(1, 0));
        assert_eq!(server.negotiate(Version::new(1, 5)).unwrap(), server);
        assert!(matches!(
            server.negotiate(Version::new(2, 0)),
            Err(ProtocolError::UnsupportedVersion(v)) if v.major == 2
        ));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
