//! Content identifiers: CIDv1, `raw` codec, sha2-256 multihash.

use cid::multihash::Multihash;
use cid::Cid;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Multicodec code for raw binary content.
pub const RAW_CODEC: u64 = 0x55;

/// Multihash code for sha2-256.
pub const SHA2_256_CODE: u64 = 0x12;

#[derive(Debug, Error)]
pub enum ContentIdError {
    #[error("invalid content identifier `{input}`: {source}")]
    Parse { input: String, source: cid::Error },

    #[error("failed to wrap digest in a multihash: {0}")]
    Multihash(#[from] cid::multihash::Error),
}

/// Identifier of a piece of content, derived from its bytes.
///
/// The text form is the base32 multibase encoding (`bafk...`). Equal bytes
/// always give equal identifiers, which makes this the lookup key for the
/// ledger, the DHT and both query protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(Cid);

impl ContentId {
    /// Hash `data` and wrap the digest as a CIDv1.
    pub fn from_data(data: &[u8]) -> Result<Self, ContentIdError> {
        let digest = Sha256::digest(data);
        let hash = Multihash::<64>::wrap(SHA2_256_CODE, &digest)?;
        Ok(Self(Cid::new_v1(RAW_CODEC, hash)))
    }

    pub fn as_cid(&self) -> &Cid {
        &self.0
    }

    /// Key used for provider records: the bare multihash bytes.
    ///
    /// Keying on the multihash rather than the full CID keeps provider
    /// records compatible with go-libp2p's `Provide`.
    pub fn dht_key(&self) -> Vec<u8> {
        self.0.hash().to_bytes()
    }
}

impl From<Cid> for ContentId {
    fn from(cid: Cid) -> Self {
        Self(cid)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ContentId {
    type Err = ContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Cid::try_from(trimmed)
            .map(Self)
            .map_err(|source| ContentIdError::Parse {
                input: trimmed.to_string(),
                source,
            })
    }
}

impl TryFrom<String> for ContentId {
    type Error = ContentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.to_string()
    }
}
