use std::fmt::Display;

/// Lower-case hexadecimal text for a run of bytes.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Hex(pub String);

impl Display for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'a> From<&'a [u8]> for Hex {
    fn from(bytes: &[u8]) -> Self {
        fn hex_digit(b: u8) -> char {
            match b {
                0..=9 => (b + b'0') as char,
                10..=15 => (b + b'a' - 10) as char,
                _ => unreachable!("bad hex digit"),
            }
        }

        let mut out = String::with_capacity(bytes.len() * 2);
        for &b in bytes {
            out.push(hex_digit((b & 0b11110000) >> 4));
            out.push(hex_digit(b & 0b00001111));
        }
        Hex(out)
    }
}

impl Hex {
    /// Decodes the text back into bytes; `None` if it is not valid hex.
    pub fn decode(&self) -> Option<Vec<u8>> {
        fn unhex_digit(h: u8) -> Option<u8> {
            match h {
                b'0'..=b'9' => Some(h - b'0'),
                b'a'..=b'f' => Some(h - b'a' + 10),
                b'A'..=b'F' => Some(h - b'A' + 10),
                _ => None,
            }
        }

        let text = self.0.as_bytes();
        if text.len() % 2 != 0 {
            return None;
        }
        text.chunks(2)
            .map(|pair| Some(unhex_digit(pair[0])? << 4 | unhex_digit(pair[1])?))
            .collect()
    }
}

/// Serde adapter writing byte buffers as hex strings, for
/// `#[serde(with = "crate::hex::bytes")]`.
pub mod bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Hex;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&Hex::from(bytes).0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hex(s)
            .decode()
            .ok_or_else(|| serde::de::Error::custom("invalid hex string"))
    }
}

#[test]
fn test_hex_round_trip() {
    let example: &[u8] = b"hello, world";
    let hex: Hex = Hex::from(example);
    assert_eq!(hex.to_string(), "68656c6c6f2c20776f726c64");
    let bytes = hex.decode().unwrap();
    assert_eq!(example, bytes.as_slice());
}

#[test]
fn test_hex_rejects_garbage() {
    assert_eq!(Hex("abc".into()).decode(), None);
    assert_eq!(Hex("zz".into()).decode(), None);
    assert_eq!(Hex("".into()).decode(), Some(vec![]));
}
