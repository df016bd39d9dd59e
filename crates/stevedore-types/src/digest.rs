use std::fmt;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Result, StoreError};

/// The only algorithm accepted on write paths.
pub const ALGORITHM: &str = "sha256";

const ENCODED_LEN: usize = 64;

/// A content digest in canonical `sha256:<64-hex-lower>` form.
///
/// Parsing is strict: any other algorithm prefix, a wrong length or
/// non-lowercase-hex characters are rejected with `BadBlobDigest`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    encoded: String,
}

impl Digest {
    /// Parse a canonical digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let encoded = s
            .strip_prefix(ALGORITHM)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| StoreError::BadBlobDigest(s.to_string()))?;

        if encoded.len() != ENCODED_LEN
            || !encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(StoreError::BadBlobDigest(s.to_string()));
        }

        Ok(Self {
            encoded: encoded.to_string(),
        })
    }

    /// Compute the digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            encoded: hex::encode(Sha256::digest(data)),
        }
    }

    /// Compute the digest of everything remaining in `reader`.
    pub fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        io::copy(&mut reader, &mut hasher)?;
        Ok(Self {
            encoded: hex::encode(hasher.finalize()),
        })
    }

    /// The algorithm component (always `sha256`).
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// The hex component, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM}:{}", self.encoded)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({ALGORITHM}:{}…)", &self.encoded[..12])
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// Incremental digest calculator for streaming writes.
///
/// The upload path tees body bytes through one of these while writing the
/// scratch file, then compares the result against the client's claim.
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest {
            encoded: hex::encode(self.hasher.finalize()),
        }
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256 of "hello"
    const HELLO: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn parse_canonical_roundtrip() {
        let d = Digest::parse(HELLO).unwrap();
        assert_eq!(d.to_string(), HELLO);
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.encoded().len(), 64);
    }

    #[test]
    fn parse_rejects_other_algorithms() {
        let s = format!("sha512:{}", "ab".repeat(64));
        assert!(matches!(
            Digest::parse(&s),
            Err(StoreError::BadBlobDigest(_))
        ));
    }

    #[test]
    fn parse_rejects_bad_hex() {
        // uppercase
        let upper = format!("sha256:{}", "AB".repeat(32));
        assert!(Digest::parse(&upper).is_err());
        // wrong length
        assert!(Digest::parse("sha256:abcd").is_err());
        // no separator
        assert!(Digest::parse("sha256abcd").is_err());
        // empty
        assert!(Digest::parse("").is_err());
    }

    #[test]
    fn from_bytes_matches_known_vector() {
        assert_eq!(Digest::from_bytes(b"hello").to_string(), HELLO);
    }

    #[test]
    fn from_reader_matches_from_bytes() {
        let d = Digest::from_reader(&b"hello"[..]).unwrap();
        assert_eq!(d, Digest::from_bytes(b"hello"));
    }

    #[test]
    fn digester_incremental_matches_one_shot() {
        let mut digester = Digester::new();
        digester.update(b"hel");
        digester.update(b"lo");
        assert_eq!(digester.finalize(), Digest::from_bytes(b"hello"));
    }

    #[test]
    fn serde_as_plain_string() {
        let d = Digest::from_bytes(b"hello");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{HELLO}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn serde_rejects_malformed_string() {
        let err = serde_json::from_str::<Digest>("\"md5:abcd\"");
        assert!(err.is_err());
    }
}
