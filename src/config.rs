/// Immutable, process-wide configuration built once at startup and passed
/// by reference into every component. No module-level mutable state.
#[derive(Clone, Debug)]
pub struct Config {
    /// Database connection string.
    pub database_url: String,

    /// Emit structured JSON logs instead of pretty-printed ones.
    pub log_json: bool,

    /// Threshold above which a repository round-trip or I/O call is logged
    /// as slow, in milliseconds.
    pub slow_operation_warn_ms: u64,

    // =========================
    // Resource configuration (§3)
    // =========================
    /// Global ceiling on concurrently-active chunks, independent of storage.
    pub resource_max_concurrent_chunks: u32,

    /// Temp-storage budget in megabytes.
    pub resource_max_temp_storage_mb: u64,

    /// Images per processing chunk. Also the chunk planner's CHUNK_SIZE.
    pub resource_chunk_size_images: u32,

    /// Estimated average image size in megabytes, used to derive the
    /// storage-backed chunk ceiling.
    pub resource_estimated_image_size_mb: f64,

    /// Fraction of the storage budget held back as safety margin (0..0.5).
    pub resource_storage_safety_margin: f64,

    // =========================
    // Cleanup configuration (§4.8)
    // =========================
    /// Filesystem / object-store prefix cleanup operates under.
    pub cleanup_temp_storage_path: String,

    /// Usage percent at or above which cleanup escalates to Emergency.
    pub cleanup_emergency_threshold: f64,

    /// Usage percent at or above which a warning is logged but Emergency is
    /// not yet triggered.
    pub cleanup_warning_threshold: f64,

    /// Maximum age, in hours, before an unmappable temp file is orphaned.
    pub cleanup_max_orphan_age_hours: i64,

    /// Upper bound on files considered per cleanup pass, to bound a single
    /// run's duration.
    pub cleanup_batch_size: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://chunk_orchestrator_dev.db".to_string());

        Self {
            database_url,
            log_json: env_bool("LOG_JSON", false),
            slow_operation_warn_ms: env_u64("SLOW_OPERATION_WARN_MS", 250),

            resource_max_concurrent_chunks: env_u32("RESOURCE_MAX_CONCURRENT_CHUNKS", 35),
            resource_max_temp_storage_mb: env_u64("RESOURCE_MAX_TEMP_STORAGE_MB", 20_000),
            resource_chunk_size_images: env_u32("RESOURCE_CHUNK_SIZE_IMAGES", 500),
            resource_estimated_image_size_mb: env_f64("RESOURCE_ESTIMATED_IMAGE_SIZE_MB", 0.5),
            resource_storage_safety_margin: env_f64("RESOURCE_STORAGE_SAFETY_MARGIN", 0.2),

            cleanup_temp_storage_path: std::env::var("CLEANUP_TEMP_STORAGE_PATH")
                .unwrap_or_else(|_| "/tmp/chunk_orchestrator".to_string()),
            cleanup_emergency_threshold: env_f64("CLEANUP_EMERGENCY_THRESHOLD", 95.0),
            cleanup_warning_threshold: env_f64("CLEANUP_WARNING_THRESHOLD", 85.0),
            cleanup_max_orphan_age_hours: env_u64("CLEANUP_MAX_ORPHAN_AGE_HOURS", 24) as i64,
            cleanup_batch_size: env_u64("CLEANUP_BATCH_SIZE", 1000) as usize,
        }
    }

    /// `effective_max_chunks = min(configured_ceiling, floor((budget*(1-margin)) / (chunk_size*image_size)))`
    pub fn effective_max_chunks(&self) -> u32 {
        let available_storage_mb =
            self.resource_max_temp_storage_mb as f64 * (1.0 - self.resource_storage_safety_margin);
        let chunk_storage_mb =
            self.resource_chunk_size_images as f64 * self.resource_estimated_image_size_mb;
        let by_storage = (available_storage_mb / chunk_storage_mb).floor() as i64;
        let by_storage = by_storage.max(0) as u32;
        self.resource_max_concurrent_chunks.min(by_storage)
    }

    pub fn chunk_storage_mb(&self) -> f64 {
        self.resource_chunk_size_images as f64 * self.resource_estimated_image_size_mb
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
