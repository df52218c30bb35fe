//! # In-Memory Store
//!
//! Keeps every bulk call as it was received, plus the resulting table contents.
//! Writes to a table can be made to fail.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{check_columns, Conn, DbError, DbResult};
use crate::updater::IdHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Certs,
    Dirty,
    Domains,
    DomainCerts,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Table::Certs => "certs",
            Table::Dirty => "dirty",
            Table::Domains => "domains",
            Table::DomainCerts => "domain_certs",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCert {
    pub parent_id: Option<IdHash>,
    pub expiration: DateTime<Utc>,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    cert_calls: Vec<Vec<IdHash>>,
    dirty_calls: Vec<Vec<IdHash>>,
    domain_calls: Vec<Vec<(IdHash, String)>>,
    domain_cert_calls: Vec<Vec<(IdHash, IdHash)>>,

    certs: BTreeMap<IdHash, StoredCert>,
    dirty: BTreeSet<IdHash>,
    domains: BTreeMap<IdHash, String>,
    domain_certs: BTreeSet<(IdHash, IdHash)>,

    failing: HashSet<Table>,
}

#[derive(Default)]
pub struct MemoryConn {
    state: Mutex<State>,
}

impl MemoryConn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write to `table` fail.
    pub fn fail_on(&self, table: Table) {
        self.state().failing.insert(table);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// IDs passed to each `update_certs` call, in call order.
    pub fn cert_calls(&self) -> Vec<Vec<IdHash>> {
        self.state().cert_calls.clone()
    }

    pub fn dirty_calls(&self) -> Vec<Vec<IdHash>> {
        self.state().dirty_calls.clone()
    }

    pub fn domain_calls(&self) -> Vec<Vec<(IdHash, String)>> {
        self.state().domain_calls.clone()
    }

    pub fn domain_cert_calls(&self) -> Vec<Vec<(IdHash, IdHash)>> {
        self.state().domain_cert_calls.clone()
    }

    pub fn cert(&self, id: &IdHash) -> Option<StoredCert> {
        self.state().certs.get(id).cloned()
    }

    pub fn cert_ids(&self) -> BTreeSet<IdHash> {
        self.state().certs.keys().copied().collect()
    }

    pub fn dirty(&self) -> BTreeSet<IdHash> {
        self.state().dirty.clone()
    }

    pub fn domains(&self) -> BTreeMap<IdHash, String> {
        self.state().domains.clone()
    }

    pub fn domain_certs(&self) -> BTreeSet<(IdHash, IdHash)> {
        self.state().domain_certs.clone()
    }
}

fn check_failing(state: &State, table: Table) -> DbResult {
    if state.failing.contains(&table) {
        Err(DbError::Injected(table))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Conn for MemoryConn {
    async fn update_certs(
        &self,
        ids: &[IdHash],
        parent_ids: &[Option<IdHash>],
        expirations: &[DateTime<Utc>],
        payloads: &[Vec<u8>],
    ) -> DbResult {
        check_columns(
            "update_certs",
            &[ids.len(), parent_ids.len(), expirations.len(), payloads.len()],
        )?;
        let mut state = self.state();
        check_failing(&state, Table::Certs)?;

        state.cert_calls.push(ids.to_vec());
        for (((id, parent), expiration), payload) in
            ids.iter().zip(parent_ids).zip(expirations).zip(payloads)
        {
            state.certs.entry(*id).or_insert_with(|| StoredCert {
                parent_id: *parent,
                expiration: *expiration,
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn insert_domains_into_dirty(&self, domain_ids: &[IdHash]) -> DbResult {
        let mut state = self.state();
        check_failing(&state, Table::Dirty)?;
        state.dirty_calls.push(domain_ids.to_vec());
        state.dirty.extend(domain_ids.iter().copied());
        Ok(())
    }

    async fn update_domains(&self, domain_ids: &[IdHash], names: &[String]) -> DbResult {
        check_columns("update_domains", &[domain_ids.len(), names.len()])?;
        let mut state = self.state();
        check_failing(&state, Table::Domains)?;

        let rows: Vec<(IdHash, String)> = domain_ids
            .iter()
            .copied()
            .zip(names.iter().cloned())
            .collect();
        for (id, name) in &rows {
            state.domains.entry(*id).or_insert_with(|| name.clone());
        }
        state.domain_calls.push(rows);
        Ok(())
    }

    async fn update_domain_certs(&self, domain_ids: &[IdHash], cert_ids: &[IdHash]) -> DbResult {
        check_columns("update_domain_certs", &[domain_ids.len(), cert_ids.len()])?;
        let mut state = self.state();
        check_failing(&state, Table::DomainCerts)?;

        let rows: Vec<(IdHash, IdHash)> = domain_ids
            .iter()
            .copied()
            .zip(cert_ids.iter().copied())
            .collect();
        state.domain_certs.extend(rows.iter().copied());
        state.domain_cert_calls.push(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_contents() {
        let conn = MemoryConn::new();
        let id = IdHash::of(b"c");
        conn.update_certs(&[id, id], &[None, None], &[Utc::now(); 2], &[vec![1], vec![2]])
            .await
            .unwrap();

        assert_eq!(conn.cert_calls(), vec![vec![id, id]]);
        assert_eq!(conn.cert_ids().len(), 1);
        assert_eq!(conn.cert(&id).unwrap().payload, vec![1]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let conn = MemoryConn::new();
        conn.fail_on(Table::Domains);
        let id = IdHash::of_name("a.com");

        conn.insert_domains_into_dirty(&[id]).await.unwrap();
        let err = conn
            .update_domains(&[id], &["a.com".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "injected failure writing domains");
        assert!(conn.domain_calls().is_empty());
        assert_eq!(conn.dirty().len(), 1);
    }
}
