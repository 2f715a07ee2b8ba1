use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// In-process counters of operational visibility (§1.1). Incremented inline by the component
/// that owns the event; read by an external exporter the crate does not ship.
#[derive(Clone, Default)]
pub struct Counters {
    pub chunks_dispatched: Arc<AtomicU64>,
    pub dispatch_capacity_warnings: Arc<AtomicU64>,
    pub completions_accepted: Arc<AtomicU64>,
    pub completions_deduplicated: Arc<AtomicU64>,
    pub cleanup_files_deleted: Arc<AtomicU64>,
    pub cleanup_runs: Arc<AtomicU64>,
    pub quota_rejected: Arc<AtomicU64>,
    pub jobs_started: Arc<AtomicU64>,
    pub jobs_cancelled: Arc<AtomicU64>,
    pub jobs_retried: Arc<AtomicU64>,
}
