//! Content hashes for cached objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

use crate::error::CoreError;

/// SHA-512 digest identifying an object's content.
///
/// Serialized as a lowercase hex string so it can be used as a JSON map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 64]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 64]);

    /// Hash a byte slice.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        Hash(out)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Relative path of this object inside an object cache directory.
    pub fn object_filename(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}/{}", &hex[0..2], &hex[2..4], &hex[4..])
    }
}

impl FromStr for Hash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidHash(e.to_string()))?;
        let array: [u8; 64] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| CoreError::InvalidHash(format!("expected 64 bytes, got {}", v.len())))?;
        Ok(Hash(array))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}…)", &self.to_hex()[..12])
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hex_roundtrip() {
        let h = Hash::of(b"hello");
        let parsed: Hash = h.to_hex().parse().unwrap();
        assert_eq!(h, parsed);
        assert!(!h.is_zero());
    }

    #[test]
    fn rejects_short_hex() {
        assert!("abcd".parse::<Hash>().is_err());
        assert!("zz".parse::<Hash>().is_err());
    }

    #[test]
    fn usable_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(Hash::of(b"a"), 1u64);
        let json = serde_json::to_string(&map).unwrap();
        let back: BTreeMap<Hash, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn object_filename_is_fanned_out() {
        let h = Hash::of(b"x");
        let name = h.object_filename();
        let hex = h.to_hex();
        assert_eq!(&name[..2], &hex[..2]);
        assert_eq!(name.matches('/').count(), 2);
        assert_eq!(name.len(), hex.len() + 2);
    }
}
