//! Blob store trait.
//!
//! Reads are chunked byte streams so callers never hold a whole file in
//! memory. Writes hand back a seekable writer, which archive formats such as
//! zip need to patch headers after an entry is written.

use std::io::{Seek, Write};
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use waypoint_types::error::BlobError;

/// Chunked read stream over a blob.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobError>> + Send>>;

/// `Write + Seek` as one object-safe trait.
pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek> WriteSeek for T {}

/// Writer handle for a new blob.
///
/// Writes block, so drive it from a blocking thread, not a runtime worker.
pub type BlobWriter = Box<dyn WriteSeek + Send>;

pub trait BlobStore: Send + Sync {
    fn exists(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<bool, BlobError>> + Send;

    /// Open a blob for streaming reads.
    fn get_stream(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<ByteStream, BlobError>> + Send;

    /// Open a new blob for writing, replacing any existing one.
    fn upload_stream(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<BlobWriter, BlobError>> + Send;
}
