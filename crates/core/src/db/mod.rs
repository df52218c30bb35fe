//! # Storage Collaborator
//!
//! The updater writes through [`Conn`]: four bulk, idempotent operations. Any
//! error is fatal to the calling stage.
//!
//! - [`SqliteConn`]: SQLite store with insert-or-ignore semantics
//! - [`MemoryConn`]: in-memory store recording every call, with failure injection

mod memory;
mod sqlite;

pub use memory::{MemoryConn, Table};
pub use sqlite::{SqliteConn, TableCounts};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::updater::IdHash;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op}: column lengths differ {lengths:?}")]
    ColumnMismatch { op: &'static str, lengths: Vec<usize> },

    #[error("connection lock poisoned")]
    Poisoned,

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("injected failure writing {0}")]
    Injected(Table),

    #[error("{op} did not complete: {source}")]
    Blocking {
        op: &'static str,
        source: tokio::task::JoinError,
    },
}

pub type DbResult<T = ()> = Result<T, DbError>;

/// Bulk writes used by the updater. All of them must be idempotent.
#[async_trait]
pub trait Conn: Send + Sync {
    async fn update_certs(
        &self,
        ids: &[IdHash],
        parent_ids: &[Option<IdHash>],
        expirations: &[DateTime<Utc>],
        payloads: &[Vec<u8>],
    ) -> DbResult;

    async fn insert_domains_into_dirty(&self, domain_ids: &[IdHash]) -> DbResult;

    async fn update_domains(&self, domain_ids: &[IdHash], names: &[String]) -> DbResult;

    async fn update_domain_certs(&self, domain_ids: &[IdHash], cert_ids: &[IdHash]) -> DbResult;
}

pub(crate) fn check_columns(op: &'static str, lengths: &[usize]) -> DbResult {
    if lengths.windows(2).all(|w| w[0] == w[1]) {
        Ok(())
    } else {
        Err(DbError::ColumnMismatch {
            op,
            lengths: lengths.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_columns() {
        assert!(check_columns("op", &[]).is_ok());
        assert!(check_columns("op", &[3, 3, 3]).is_ok());
        let err = check_columns("update_certs", &[3, 2]).unwrap_err();
        assert_eq!(err.to_string(), "update_certs: column lengths differ [3, 2]");
    }
}
