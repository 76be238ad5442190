//! Group archiving: stream every file of a group into one archive blob.
//!
//! The archive format sits behind [`ArchiveFactory`] / [`ArchiveSink`];
//! waypoint-infra provides the zip implementation. [`step`] holds the
//! subtask step that drives it.

pub mod step;

use std::collections::HashSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use waypoint_types::error::BlobError;

use crate::engine::step::StepError;
use crate::storage::blob_store::ByteStream;

/// Entry name of the optional manifest.
pub const MANIFEST_ENTRY: &str = "manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The output location cannot be opened right now.
    #[error("archive output unavailable: {0}")]
    Unavailable(String),

    /// Reading a source stream failed. The entry was discarded.
    #[error("archive source failed: {0}")]
    Source(#[from] BlobError),

    #[error("archive write failed: {0}")]
    Write(String),

    #[error("archive already finalized")]
    Finalized,
}

impl From<ArchiveError> for StepError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Source(blob) => StepError::Blob(blob),
            other => StepError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Totals reported once an archive is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub entries: usize,
    /// Uncompressed bytes across all entries.
    pub bytes_written: u64,
}

/// An archive being written.
///
/// Methods take `&self` so appends can be issued from several workers;
/// implementations serialize access to the underlying writer.
pub trait ArchiveSink: Send + Sync {
    /// Stream one entry into the archive. Returns the bytes written.
    fn append(
        &self,
        entry_name: &str,
        stream: ByteStream,
    ) -> impl std::future::Future<Output = Result<u64, ArchiveError>> + Send;

    fn append_bytes(
        &self,
        entry_name: &str,
        bytes: Bytes,
    ) -> impl std::future::Future<Output = Result<u64, ArchiveError>> + Send;

    /// Flush and close the archive. Further appends fail.
    fn finalize(
        &self,
    ) -> impl std::future::Future<Output = Result<ArchiveSummary, ArchiveError>> + Send;
}

/// Opens archive sinks at blob paths.
pub trait ArchiveFactory: Send + Sync {
    type Sink: ArchiveSink + 'static;

    fn create(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<Self::Sink, ArchiveError>> + Send;
}

/// Make entry names unique, in order.
///
/// Later duplicates become `name (2).ext`, `name (3).ext` and so on. Path
/// separators are replaced so every entry lands at the archive root, and
/// `reserved` names are never handed out.
pub fn unique_entry_names<'a, I>(names: I, reserved: &[&str]) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut taken: HashSet<String> = reserved.iter().map(|s| s.to_string()).collect();
    let mut out = Vec::new();

    for raw in names {
        let name = sanitize(raw);
        let mut candidate = name.clone();
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = numbered(&name, n);
            n += 1;
        }
        taken.insert(candidate.clone());
        out.push(candidate);
    }

    out
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

fn numbered(name: &str, n: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}
