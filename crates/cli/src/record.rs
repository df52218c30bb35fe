//! JSON-lines certificate records.
//!
//! One record per line: a leaf with its names and its chain, leaf parent first.
//!
//! ```json
//! {"payload":"30820a..","expiration":"2026-01-01T00:00:00Z","names":["a.com"],
//!  "chain":[{"payload":"3082..","expiration":"2030-01-01T00:00:00Z"},{"id":"9f86.."}]}
//! ```
//!
//! A chain member given only by `id` is already stored, and so are its ancestors.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ctmap_core::updater::{CertWithChain, ChainCert, IdHash};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CertRecord {
    pub payload: String,
    pub expiration: DateTime<Utc>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub chain: Vec<ChainRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ChainRecord {
    pub id: Option<IdHash>,
    pub payload: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl CertRecord {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("malformed record")
    }

    pub fn into_chain(self) -> Result<CertWithChain> {
        let payload = hex::decode(&self.payload).context("leaf payload is not hex")?;
        let mut chain_ids = Vec::with_capacity(self.chain.len());
        let mut chain = Vec::with_capacity(self.chain.len());

        for (i, member) in self.chain.into_iter().enumerate() {
            match (member.payload, member.id) {
                (Some(hex_payload), id) => {
                    let payload = hex::decode(&hex_payload)
                        .with_context(|| format!("chain[{i}] payload is not hex"))?;
                    let computed = IdHash::of(&payload);
                    if id.is_some_and(|id| id != computed) {
                        bail!("chain[{i}] id does not match its payload");
                    }
                    let expiration = member
                        .expiration
                        .with_context(|| format!("chain[{i}] has no expiration"))?;
                    chain_ids.push(computed);
                    chain.push(Some(ChainCert {
                        payload,
                        expiration,
                    }));
                }
                (None, Some(id)) => {
                    chain_ids.push(id);
                    chain.push(None);
                }
                (None, None) => bail!("chain[{i}] has neither id nor payload"),
            }
        }

        Ok(CertWithChain {
            cert_id: IdHash::of(&payload),
            payload,
            expiration: self.expiration,
            names: self.names,
            chain_ids,
            chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_record() {
        let root_id = IdHash::of([0xcc]);
        let line = format!(
            r#"{{"payload":"aa","expiration":"2026-01-01T00:00:00Z","names":["a.com"],
               "chain":[{{"payload":"bb","expiration":"2030-01-01T00:00:00Z"}},{{"id":"{root_id}"}}]}}"#
        );
        let chain = CertRecord::parse(&line).unwrap().into_chain().unwrap();

        assert_eq!(chain.cert_id, IdHash::of([0xaa]));
        assert_eq!(chain.names, vec!["a.com"]);
        assert_eq!(chain.chain_ids, vec![IdHash::of([0xbb]), root_id]);
        assert!(chain.chain[0].is_some());
        assert!(chain.chain[1].is_none());

        let certs = chain.unfold();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[1].parent_id, Some(root_id));
    }

    #[test]
    fn test_rejects_bad_records() {
        assert!(CertRecord::parse("{not json").is_err());

        let bad_hex = CertRecord::parse(r#"{"payload":"zz","expiration":"2026-01-01T00:00:00Z"}"#)
            .unwrap()
            .into_chain();
        assert!(bad_hex.is_err());

        let empty_member = CertRecord::parse(
            r#"{"payload":"aa","expiration":"2026-01-01T00:00:00Z","chain":[{}]}"#,
        )
        .unwrap()
        .into_chain();
        assert!(empty_member.is_err());

        let mismatched = CertRecord::parse(&format!(
            r#"{{"payload":"aa","expiration":"2026-01-01T00:00:00Z","chain":[{{"id":"{}","payload":"bb","expiration":"2030-01-01T00:00:00Z"}}]}}"#,
            IdHash::of([0xcc])
        ))
        .unwrap()
        .into_chain();
        assert!(mismatched.is_err());
    }
}
