//! Integrity verification over ordered chunk sequences.
//!
//! The checksum is BLAKE3 over the exact concatenation of chunk payloads in
//! ascending index order, with no padding or framing between chunks.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Digest of a single contiguous buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s)
            .map(|h| Self(*h.as_bytes()))
            .map_err(|e| format!("invalid checksum `{s}`: {e}"))
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Computes and checks tensor checksums.
#[derive(Debug, Default, Clone, Copy)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// Start an incremental checksum; feed chunks in ascending index order.
    pub fn begin(&self) -> ChecksumBuilder {
        ChecksumBuilder {
            hasher: blake3::Hasher::new(),
        }
    }

    /// Checksum over chunks given in ascending index order.
    pub fn compute_checksum<'a, I>(&self, chunks: I) -> Checksum
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        let mut builder = self.begin();
        for chunk in chunks {
            builder.update(chunk);
        }
        builder.finish()
    }

    /// Whether `chunks` hash to `expected`.
    pub fn matches<'a, I>(&self, chunks: I, expected: &Checksum) -> bool
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        self.compute_checksum(chunks).ct_eq(expected)
    }
}

impl Checksum {
    /// Constant-time comparison.
    pub fn ct_eq(&self, other: &Checksum) -> bool {
        blake3::Hash::from(self.0) == blake3::Hash::from(other.0)
    }
}

/// Running checksum over a chunk sequence.
pub struct ChecksumBuilder {
    hasher: blake3::Hasher,
}

impl ChecksumBuilder {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(self) -> Checksum {
        Checksum(*self.hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_covers_concatenation() {
        let verifier = Verifier::new();
        let split = vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")];
        let whole = Checksum::of(b"hello world");
        assert_eq!(verifier.compute_checksum(&split), whole);
        assert!(verifier.matches(&split, &whole));
    }

    #[test]
    fn test_checksum_order_sensitive() {
        let verifier = Verifier::new();
        let a = vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")];
        let b = vec![Bytes::from_static(b"cd"), Bytes::from_static(b"ab")];
        assert_ne!(verifier.compute_checksum(&a), verifier.compute_checksum(&b));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let verifier = Verifier::new();
        let mut builder = verifier.begin();
        builder.update(&[1, 2, 3]);
        builder.update(&[]);
        builder.update(&[4]);
        assert_eq!(builder.finish(), Checksum::of(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_hex_roundtrip_and_serde() {
        let sum = Checksum::of(b"tensor");
        let parsed: Checksum = sum.to_hex().parse().unwrap();
        assert_eq!(parsed, sum);

        let json = serde_json::to_string(&sum).unwrap();
        assert_eq!(json, format!("\"{}\"", sum.to_hex()));
        assert!("zz".parse::<Checksum>().is_err());
    }
}
