//! Content digests addressing layers and cache records

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A content digest in `algorithm:hex` form, e.g. `sha256:ab12…`.
///
/// Serialized as the plain string on the wire.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    encoded: String,
}

impl Digest {
    /// Compute the sha256 digest of `content`.
    #[must_use]
    pub fn sha256(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self {
            algorithm: "sha256".to_string(),
            encoded: hex::encode(hasher.finalize()),
        }
    }

    /// The digest algorithm, e.g. `sha256`.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The hex-encoded digest value.
    #[must_use]
    pub fn encoded(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s.split_once(':').ok_or_else(|| Error::invalid_digest(s))?;
        if algorithm.is_empty()
            || encoded.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            || !encoded.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::invalid_digest(s));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: encoded.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}
