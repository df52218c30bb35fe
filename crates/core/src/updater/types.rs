//! # Updater Types
//!
//! Identity hashes, certificates and dirty domains as they flow through the
//! updater.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Length in bytes of an identity hash.
pub const ID_LEN: usize = 32;

/// SHA-256 identity of a certificate payload or a domain name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct IdHash(pub [u8; ID_LEN]);

impl IdHash {
    /// Hash arbitrary bytes.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(data.as_ref()).into())
    }

    /// Identity of a domain name.
    pub fn of_name(name: &str) -> Self {
        Self::of(name.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; ID_LEN]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Display for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for IdHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IdHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// One certificate, without its ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub cert_id: IdHash,
    /// DER payload.
    pub payload: Vec<u8>,
    pub expiration: DateTime<Utc>,
    /// `None` for the root of a chain.
    pub parent_id: Option<IdHash>,
    /// Asserted names. Only leaf certificates carry them.
    pub names: Option<Vec<String>>,
}

impl Certificate {
    /// Build a certificate whose identity is the hash of its payload.
    pub fn new(
        payload: Vec<u8>,
        expiration: DateTime<Utc>,
        parent_id: Option<IdHash>,
        names: Option<Vec<String>>,
    ) -> Self {
        Self {
            cert_id: IdHash::of(&payload),
            payload,
            expiration,
            parent_id,
            names,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.names.is_some()
    }
}

/// A (domain, certificate) pair whose domain needs its proof recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirtyDomain {
    pub domain_id: IdHash,
    pub cert_id: IdHash,
    pub name: String,
}

impl DirtyDomain {
    pub fn new(cert_id: IdHash, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            domain_id: IdHash::of_name(&name),
            cert_id,
            name,
        }
    }
}

/// Payload and expiration of a chain member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainCert {
    pub payload: Vec<u8>,
    pub expiration: DateTime<Utc>,
}

/// A leaf certificate with its trust chain, leaf parent first and root last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertWithChain {
    pub cert_id: IdHash,
    pub payload: Vec<u8>,
    pub expiration: DateTime<Utc>,
    pub names: Vec<String>,
    pub chain_ids: Vec<IdHash>,
    /// Same length as `chain_ids`. `None` marks an ancestor that is already stored,
    /// which implies all of its own ancestors are stored too.
    pub chain: Vec<Option<ChainCert>>,
}

impl CertWithChain {
    /// Split into insertable certificates: the leaf, then each ancestor not yet
    /// stored, each pointing at the next one as its parent.
    pub fn unfold(self) -> Vec<Certificate> {
        let mut certs = Vec::with_capacity(self.chain.len() + 1);
        certs.push(Certificate {
            cert_id: self.cert_id,
            payload: self.payload,
            expiration: self.expiration,
            parent_id: self.chain_ids.first().copied(),
            names: Some(self.names),
        });

        for (i, member) in self.chain.into_iter().enumerate() {
            let (Some(member), Some(&cert_id)) = (member, self.chain_ids.get(i)) else {
                break;
            };
            certs.push(Certificate {
                cert_id,
                payload: member.payload,
                expiration: member.expiration,
                parent_id: self.chain_ids.get(i + 1).copied(),
                names: None,
            });
        }
        certs
    }
}
