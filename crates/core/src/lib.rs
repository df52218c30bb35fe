//! # CT Map Core
//!
//! Ingestion core of the certificate-transparency mapserver: parsed certificates
//! go in, and the certificate, domain and dirty-domain tables come out.
//!
//! ## Architecture
//!
//! - `pipeline/` - Generic stage engine (stages, sources, sinks, linking, stall, auto-resume, joining)
//! - `updater/` - Sharded manager with certificate and domain workers
//! - `db/` - Storage collaborator trait, SQLite and in-memory stores
//! - `cache/` - Presence cache of already written certificates
//! - `config` - Ingest configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ctmap_core::db::SqliteConn;
//! use ctmap_core::updater::Manager;
//!
//! let conn = Arc::new(SqliteConn::open_at("map.db")?);
//! let mut manager = Manager::new(4, conn, 1000, Duration::from_secs(1), None)?;
//! manager.resume()?;
//! manager.process_certificates(certs).await?;
//! manager.wait().await?;
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod pipeline;
pub mod updater;
