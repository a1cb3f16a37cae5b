use crate::hex;

use serde::Serialize;
use std::fmt::Display;

/// Digest of one revision's full (uncompressed) content.
/// Under the hood, this is a [`blake3`] hash.
///
/// It is displayed in hexadecimal format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentDigest(blake3::Hash);

pub const DIGEST_BYTES: usize = blake3::OUT_LEN;

impl ContentDigest {
    pub fn of(content: &[u8]) -> Self {
        ContentDigest(blake3::hash(content))
    }

    pub fn from_bytes(bytes: [u8; DIGEST_BYTES]) -> Self {
        ContentDigest(blake3::Hash::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        self.0.as_bytes()
    }
}

impl Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b: &[u8] = self.0.as_bytes();
        write!(f, "{}", hex::Hex::from(b))
    }
}

impl Serialize for ContentDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

#[test]
fn test_digest_identifies_content() {
    let a = ContentDigest::of(b"hello, world");
    assert_eq!(a, ContentDigest::of(b"hello, world"));
    assert_ne!(a, ContentDigest::of(b"hello, world!"));
    assert_eq!(ContentDigest::from_bytes(*a.as_bytes()), a);
    assert_eq!(a.to_string().len(), DIGEST_BYTES * 2);
}

#[test]
fn test_digest_json() {
    let digest = ContentDigest::of(b"revision");
    let json = serde_json::to_value(digest).unwrap();
    assert_eq!(json, serde_json::Value::String(digest.to_string()));
}
