//! # Storage drivers
//!
//! The capability set every blob storage backend provides to the registry:
//! whole-object upload and read, metadata, moves, recursive prefix deletes,
//! optional presigned redirects, and driver-native multipart uploads.

mod driver;
mod error;
pub mod paths;

pub use driver::BoxReader;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Part;
pub use driver::Reader;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;

/// Objects at or below this size are moved with a single copy.
pub const MULTIPART_COPY_THRESHOLD: u64 = 32 * 1024 * 1024;

/// Range size of each part when a move falls back to a multipart copy.
pub const MULTIPART_COPY_PART_SIZE: u64 = 32 * 1024 * 1024;

/// Upper bound on concurrently running part copies for one move.
pub const MULTIPART_COPY_CONCURRENCY: usize = 100;

/// Keys removed per batch by a recursive delete.
pub const DELETE_BATCH_SIZE: usize = 1000;
