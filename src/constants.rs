// src/constants.rs
//
// Centralized constants for r2up to avoid hardcoded values throughout the codebase

/// One MiB in bytes.
pub const MIB: u64 = 1024 * 1024;

/// Minimum multipart part size (8 MiB). The platform floor is 5 MiB for every
/// part except the last; 8 MiB leaves headroom and keeps part counts sane.
pub const MIN_PART_SIZE: u64 = 8 * MIB;

/// Maximum multipart part size (64 MiB), bounding per-part memory.
pub const MAX_PART_SIZE: u64 = 64 * MIB;

/// Target number of parts the planner aims for on typical large files.
pub const TARGET_PART_COUNT: u64 = 6;

/// Files at or above this size take the multipart path; smaller files are a
/// single signed PUT.
pub const MULTIPART_THRESHOLD: u64 = 70 * MIB;

/// Maximum concurrent in-flight part uploads per task.
pub const PART_CONCURRENCY: usize = 6;

/// Upper bound on tasks kept in the in-memory list.
pub const MAX_TRACKED_TASKS: usize = 50;

/// File name of the resume store (a single JSON map, rewritten in full).
pub const RESUME_STORE_FILE: &str = "r2up_multipart_resume_v1.json";

/// Minimum elapsed-time window for speed computation, to avoid spikes from
/// bursty progress callbacks.
pub const SPEED_WINDOW_FLOOR_SECS: f64 = 0.25;

/// Granularity of request-body chunks handed to the HTTP client; progress is
/// reported once per chunk.
pub const STREAM_CHUNK_SIZE: usize = 256 * 1024;

/// Content type used when the source file does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
