//! # Revision Archives
//!
//! Single-file revision archives: every versioned file is stored as one
//! archive holding a tree of revisions numbered like `1.3` or `1.3.1.1`,
//! together with per-revision locks and named labels.

mod delta;
mod hex;

/// Dotted revision numbers and how new ones are derived.
pub mod revision_id;
/// Content digests of stored revisions.
pub mod digest;
/// Per-revision metadata and the ordered store holding it.
pub mod revision;
/// Fixed and floating labels.
pub mod label;
/// File-level archive metadata.
pub mod header;
/// The in-memory archive model and its operations.
pub mod archive;
/// The binary archive file format.
pub mod codec;
/// Reading and atomically replacing archive files.
pub mod storage;
/// Transactional operations on one archive file.
pub mod engine;
/// Sources of file ids for new archives.
pub mod registry;
/// Client requests and responses.
pub mod request;
/// Serving requests against a directory of archives.
pub mod dispatch;
/// Server settings read from JSON.
pub mod config;
/// Rejections and faults.
pub mod error;
