use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest;
use uuid::Uuid;

use crate::error::{PfsError, Result};

pub fn sha256sum(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    let result1 = hasher.finalize();
    let mut result = [0u8; 32];
    result.copy_from_slice(result1.as_slice());
    result
}

/// Lowercase hex rendering of a digest.
pub fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = PfsError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| PfsError::InvalidArgument(format!("bad {}: {e}", stringify!($name))))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a blob, unique across the system.
    BlobId
);

uuid_id!(
    /// Identifier of a chunk, unique across the system.
    ChunkId
);

/// Check that an address is an opaque `host:port` string.
///
/// The host part may be a name or an IP literal (IPv6 in brackets); the port
/// must be a non-zero `u16`.
pub fn validate_address(address: &str) -> Result<()> {
    let malformed = || PfsError::MalformedAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(malformed)?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(malformed());
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(malformed());
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert!(validate_address("localhost:4100").is_ok());
        assert!(validate_address("10.0.0.7:9").is_ok());
        assert!(validate_address("[::1]:4200").is_ok());

        for bad in ["", "localhost", ":4100", "host:", "host:0", "host:70000", "::1:80", "a b:1"] {
            assert!(
                matches!(validate_address(bad), Err(PfsError::MalformedAddress(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn ids_parse_back() {
        let id = ChunkId::new();
        let parsed: ChunkId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<BlobId>().is_err());
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            hex(&sha256sum(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
