//! # SQLite Store
//!
//! Certificates, domains, the dirty-domain set and the domain/certificate
//! association, in one SQLite database.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;

use super::{check_columns, Conn, DbError, DbResult};
use crate::updater::IdHash;

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

pub struct SqliteConn {
    conn: Arc<Mutex<Connection>>,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub certs: u64,
    pub domains: u64,
    pub dirty: u64,
    pub domain_certs: u64,
}

impl SqliteConn {
    /// Open or create the database at `path`.
    pub fn open_at<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path.as_ref())?)
    }

    /// Private database living as long as this value (useful for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> DbResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current < 1 {
            migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            tracing::info!(version = SCHEMA_VERSION, "database schema created");
        }
        Ok(())
    }

    pub fn schema_version(&self) -> DbResult<i32> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?)
    }

    pub fn count_certs(&self) -> DbResult<u64> {
        self.count("certs")
    }

    pub fn counts(&self) -> DbResult<TableCounts> {
        Ok(TableCounts {
            certs: self.count("certs")?,
            domains: self.count("domains")?,
            dirty: self.count("dirty")?,
            domain_certs: self.count("domain_certs")?,
        })
    }

    fn count(&self, table: &str) -> DbResult<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(n.max(0) as u64)
    }

    /// Domains whose proofs need recomputing, sorted by ID.
    pub fn dirty_domain_ids(&self) -> DbResult<Vec<IdHash>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT domain_id FROM dirty ORDER BY domain_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        rows.map(|blob| to_id(&blob?)).collect()
    }

    /// Stored domain names, sorted.
    pub fn domain_names(&self) -> DbResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM domains ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Certificates associated with a domain, sorted by ID.
    pub fn certs_for_domain(&self, domain_id: &IdHash) -> DbResult<Vec<IdHash>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT cert_id FROM domain_certs WHERE domain_id = ?1 ORDER BY cert_id",
        )?;
        let rows = stmt.query_map([domain_id.as_bytes().as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        rows.map(|blob| to_id(&blob?)).collect()
    }

    /// Parent of a stored certificate: `None` when unknown, `Some(None)` for a root.
    pub fn cert_parent(&self, cert_id: &IdHash) -> DbResult<Option<Option<IdHash>>> {
        let conn = self.lock()?;
        let parent = conn
            .query_row(
                "SELECT parent_id FROM certs WHERE id = ?1",
                [cert_id.as_bytes().as_slice()],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?;
        parent
            .map(|p| p.as_deref().map(to_id).transpose())
            .transpose()
    }
}

fn migrate_v1(conn: &Connection) -> DbResult {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS certs (
            id BLOB PRIMARY KEY,
            parent_id BLOB,
            expiration TEXT NOT NULL,
            payload BLOB NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS domains (
            domain_id BLOB PRIMARY KEY,
            name TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dirty (domain_id BLOB PRIMARY KEY)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS domain_certs (
            domain_id BLOB NOT NULL,
            cert_id BLOB NOT NULL,
            PRIMARY KEY (domain_id, cert_id)
        )
        "#,
        [],
    )?;
    Ok(())
}

fn to_id(blob: &[u8]) -> DbResult<IdHash> {
    IdHash::from_slice(blob).ok_or_else(|| DbError::Corrupt(format!("{}-byte id", blob.len())))
}

impl SqliteConn {
    /// Run `body` inside one transaction on the blocking pool.
    async fn write<F>(&self, op: &'static str, body: F) -> DbResult
    where
        F: FnOnce(&Transaction<'_>) -> DbResult + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> DbResult {
            let mut conn = conn.lock().map_err(|_| DbError::Poisoned)?;
            let tx = conn.transaction()?;
            body(&tx)?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|source| DbError::Blocking { op, source })?
    }
}

#[async_trait]
impl Conn for SqliteConn {
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
        let rows: Vec<_> = ids
            .iter()
            .zip(parent_ids)
            .zip(expirations)
            .zip(payloads)
            .map(|(((id, parent), expiration), payload)| {
                (*id, *parent, expiration.to_rfc3339(), payload.clone())
            })
            .collect();
        let count = rows.len();

        self.write("update_certs", move |tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO certs (id, parent_id, expiration, payload) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (id, parent, expiration, payload) in &rows {
                stmt.execute(params![
                    id.as_bytes().as_slice(),
                    parent.as_ref().map(|p| p.as_bytes().to_vec()),
                    expiration,
                    payload,
                ])?;
            }
            Ok(())
        })
        .await?;
        tracing::trace!(rows = count, "certs written");
        Ok(())
    }

    async fn insert_domains_into_dirty(&self, domain_ids: &[IdHash]) -> DbResult {
        let domain_ids = domain_ids.to_vec();
        self.write("insert_domains_into_dirty", move |tx| {
            let mut stmt =
                tx.prepare_cached("INSERT OR IGNORE INTO dirty (domain_id) VALUES (?1)")?;
            for id in &domain_ids {
                stmt.execute([id.as_bytes().as_slice()])?;
            }
            Ok(())
        })
        .await
    }

    async fn update_domains(&self, domain_ids: &[IdHash], names: &[String]) -> DbResult {
        check_columns("update_domains", &[domain_ids.len(), names.len()])?;
        let rows: Vec<(IdHash, String)> = domain_ids.iter().copied().zip(names.to_vec()).collect();
        self.write("update_domains", move |tx| {
            let mut stmt = tx
                .prepare_cached("INSERT OR IGNORE INTO domains (domain_id, name) VALUES (?1, ?2)")?;
            for (id, name) in &rows {
                stmt.execute(params![id.as_bytes().as_slice(), name])?;
            }
            Ok(())
        })
        .await
    }

    async fn update_domain_certs(&self, domain_ids: &[IdHash], cert_ids: &[IdHash]) -> DbResult {
        check_columns("update_domain_certs", &[domain_ids.len(), cert_ids.len()])?;
        let rows: Vec<(IdHash, IdHash)> =
            domain_ids.iter().copied().zip(cert_ids.iter().copied()).collect();
        self.write("update_domain_certs", move |tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO domain_certs (domain_id, cert_id) VALUES (?1, ?2)",
            )?;
            for (domain_id, cert_id) in &rows {
                stmt.execute(params![
                    domain_id.as_bytes().as_slice(),
                    cert_id.as_bytes().as_slice()
                ])?;
            }
            Ok(())
        })
        .await
    }
}
