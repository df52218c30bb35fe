//! # Updater
//!
//! Sharded ingestion of parsed certificates into the map database.
//!
//! - [`Manager`]: owns the source, the certificate workers and the domain workers
//! - [`CertWorker`]: batches, deduplicates and writes certificates
//! - [`DomainWorker`]: writes the dirty, domain and domain/certificate tables
//! - [`Shard`]: top-bits routing of identity hashes
//! - [`Stats`]: counters reported on an interval

mod cert_worker;
mod dedup;
mod domain_worker;
mod manager;
mod shard;
mod stats;
mod types;

pub use cert_worker::CertWorker;
pub use dedup::{dedup_columns, Columns};
pub use domain_worker::DomainWorker;
pub use manager::{Manager, UpdaterError, WorkerContext};
pub use shard::Shard;
pub use stats::{Stats, StatsFn, StatsSnapshot};
pub use types::{CertWithChain, Certificate, ChainCert, DirtyDomain, IdHash, ID_LEN};
