// src/lib.rs
//
// Crate root — public re-exports.
//
// r2up is the resumable chunked upload engine of an object-storage admin
// console: it splits large files into parts, uploads them with bounded
// concurrency through presigned URLs, persists resume state across process
// restarts, and drives completion/abort against an S3-compatible
// multipart-upload protocol. Listing, deletion and the rest of the admin
// surface are external collaborators reached through the protocol seam.

pub mod constants;
pub mod engine;
pub mod file_source;
pub mod planner;
pub mod progress;
pub mod protocol;
pub mod resume_store;
pub mod task;
pub mod transfer;

mod multipart;

pub use engine::{EngineConfig, UploadEngine, UploadEvent};
pub use file_source::FileSource;
pub use planner::pick_part_size;
pub use progress::{LoadedSink, ProgressFn, SpeedMeter, format_size, format_speed};
pub use protocol::{CompletedPart, HttpMultipartClient, MultipartProtocol};
pub use resume_store::{MultipartResumeRecord, ResumeStore};
pub use task::{MultipartState, TaskId, UploadStatus, UploadTask, resume_key};
pub use transfer::{ChunkTransport, HttpTransport, TransferError};
