//! Zip implementation of the archive ports.
//!
//! Entries are deflated straight into the blob writer as chunks arrive, so
//! no source file is ever held in memory whole. The zip writer and its
//! blocking file live on a `spawn_blocking` thread; appends feed it through
//! a bounded channel, which gives backpressure against slow disks. Entries
//! are sequential in a zip stream, so concurrent appends queue on a lock
//! while their sources are already open.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use waypoint_core::archive::{ArchiveError, ArchiveFactory, ArchiveSink, ArchiveSummary};
use waypoint_core::storage::blob_store::{BlobStore, BlobWriter, ByteStream};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Chunks buffered between the async side and the writer thread.
const WRITE_QUEUE: usize = 16;

/// Opens zip archives in a blob store.
pub struct ZipArchiver<B> {
    blobs: Arc<B>,
}

impl<B: BlobStore> ZipArchiver<B> {
    pub fn new(blobs: Arc<B>) -> Self {
        Self { blobs }
    }
}

impl<B: BlobStore + 'static> ArchiveFactory for ZipArchiver<B> {
    type Sink = ZipArchiveSink;

    async fn create(&self, path: &str) -> Result<ZipArchiveSink, ArchiveError> {
        let writer = self.blobs.upload_stream(path).await.map_err(|e| {
            if e.is_unavailable() {
                ArchiveError::Unavailable(e.to_string())
            } else {
                ArchiveError::Write(e.to_string())
            }
        })?;
        Ok(ZipArchiveSink::new(writer))
    }
}

type Reply = oneshot::Sender<Result<(), String>>;

enum ZipCommand {
    Start(String),
    Chunk(Bytes),
    /// Discard the entry being written.
    Abort(Reply),
    /// Close the entry being written.
    End(Reply),
    /// Write the central directory and flush.
    Finish(Reply),
}

/// Owns the zip writer on a blocking thread until `Finish` or hang-up.
///
/// The first write error sticks: later commands are skipped and every reply
/// carries it.
fn run_writer(mut writer: ZipWriter<BlobWriter>, mut rx: mpsc::Receiver<ZipCommand>) {
    let mut failed: Option<String> = None;
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    while let Some(command) = rx.blocking_recv() {
        match command {
            ZipCommand::Start(name) => {
                if failed.is_none() {
                    failed = writer.start_file(name, options).err().map(|e| e.to_string());
                }
            }
            ZipCommand::Chunk(chunk) => {
                if failed.is_none() {
                    failed = writer.write_all(&chunk).err().map(|e| e.to_string());
                }
            }
            ZipCommand::Abort(reply) => {
                if failed.is_none() {
                    failed = writer.abort_file().err().map(|e| e.to_string());
                }
                let _ = reply.send(failed.clone().map_or(Ok(()), Err));
            }
            ZipCommand::End(reply) => {
                let _ = reply.send(failed.clone().map_or(Ok(()), Err));
            }
            ZipCommand::Finish(reply) => {
                let result = match failed {
                    Some(err) => Err(err),
                    None => writer
                        .finish()
                        .and_then(|mut inner| inner.flush().map_err(Into::into))
                        .map_err(|e| e.to_string()),
                };
                let _ = reply.send(result);
                return;
            }
        }
    }
}

struct ZipState {
    /// `None` once finalized.
    commands: Option<mpsc::Sender<ZipCommand>>,
    worker: Option<JoinHandle<()>>,
    summary: ArchiveSummary,
}

pub struct ZipArchiveSink {
    state: Mutex<ZipState>,
}

impl ZipArchiveSink {
    /// Start the writer thread. Must be called inside a tokio runtime.
    pub fn new(writer: BlobWriter) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let zip = ZipWriter::new(writer);
        let worker = tokio::task::spawn_blocking(move || run_writer(zip, rx));
        Self {
            state: Mutex::new(ZipState {
                commands: Some(tx),
                worker: Some(worker),
                summary: ArchiveSummary::default(),
            }),
        }
    }
}

fn writer_gone() -> ArchiveError {
    ArchiveError::Write("zip writer stopped".to_string())
}

async fn send(tx: &mpsc::Sender<ZipCommand>, command: ZipCommand) -> Result<(), ArchiveError> {
    tx.send(command).await.map_err(|_| writer_gone())
}

/// Send a command carrying a reply slot and wait for the writer's answer.
async fn request(
    tx: &mpsc::Sender<ZipCommand>,
    command: impl FnOnce(Reply) -> ZipCommand,
) -> Result<(), ArchiveError> {
    let (reply, answer) = oneshot::channel();
    send(tx, command(reply)).await?;
    answer
        .await
        .map_err(|_| writer_gone())?
        .map_err(ArchiveError::Write)
}

impl ArchiveSink for ZipArchiveSink {
    async fn append(&self, entry_name: &str, mut stream: ByteStream) -> Result<u64, ArchiveError> {
        let mut state = self.state.lock().await;
        let tx = state.commands.clone().ok_or(ArchiveError::Finalized)?;
        send(&tx, ZipCommand::Start(entry_name.to_string())).await?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    written += chunk.len() as u64;
                    send(&tx, ZipCommand::Chunk(chunk)).await?;
                }
                Err(e) => {
                    // Drop the half-written entry so the archive stays valid.
                    request(&tx, ZipCommand::Abort).await?;
                    return Err(ArchiveError::Source(e));
                }
            }
        }
        request(&tx, ZipCommand::End).await?;

        state.summary.entries += 1;
        state.summary.bytes_written += written;
        tracing::trace!(entry = entry_name, bytes = written, "zip entry written");
        Ok(written)
    }

    async fn append_bytes(&self, entry_name: &str, bytes: Bytes) -> Result<u64, ArchiveError> {
        let mut state = self.state.lock().await;
        let tx = state.commands.clone().ok_or(ArchiveError::Finalized)?;
        let written = bytes.len() as u64;
        send(&tx, ZipCommand::Start(entry_name.to_string())).await?;
        send(&tx, ZipCommand::Chunk(bytes)).await?;
        request(&tx, ZipCommand::End).await?;

        state.summary.entries += 1;
        state.summary.bytes_written += written;
        Ok(written)
    }

    async fn finalize(&self) -> Result<ArchiveSummary, ArchiveError> {
        let mut state = self.state.lock().await;
        let tx = state.commands.take().ok_or(ArchiveError::Finalized)?;
        let finished = request(&tx, ZipCommand::Finish).await;
        drop(tx);
        if let Some(worker) = state.worker.take() {
            worker
                .await
                .map_err(|e| ArchiveError::Write(format!("zip writer panicked: {e}")))?;
        }
        finished?;
        Ok(state.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use tempfile::TempDir;
    use waypoint_types::error::BlobError;

    use crate::storage::local_blob::LocalBlobStore;

    fn stream_of(parts: Vec<Result<&'static [u8], BlobError>>) -> ByteStream {
        let items: Vec<Result<Bytes, BlobError>> = parts
            .into_iter()
            .map(|p| p.map(Bytes::from_static))
            .collect();
        Box::pin(futures_util::stream::iter(items))
    }

    fn read_zip(path: &std::path::Path) -> Vec<(String, String)> {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let mut out = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            out.push((entry.name().to_string(), contents));
        }
        out
    }

    #[tokio::test]
    async fn writes_readable_zip() {
        let tmp = TempDir::new().unwrap();
        let archiver = ZipArchiver::new(Arc::new(LocalBlobStore::new(tmp.path())));
        let sink = archiver.create("archives/out.zip").await.unwrap();

        let n = sink
            .append("a.txt", stream_of(vec![Ok(b"hello "), Ok(b"world")]))
            .await
            .unwrap();
        assert_eq!(n, 11);
        sink.append_bytes("manifest.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let summary = sink.finalize().await.unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.bytes_written, 13);

        let entries = read_zip(&tmp.path().join("archives/out.zip"));
        assert_eq!(
            entries,
            vec![
                ("a.txt".to_string(), "hello world".to_string()),
                ("manifest.json".to_string(), "{}".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_source_is_dropped_from_archive() {
        let tmp = TempDir::new().unwrap();
        let archiver = ZipArchiver::new(Arc::new(LocalBlobStore::new(tmp.path())));
        let sink = archiver.create("out.zip").await.unwrap();

        sink.append("good.txt", stream_of(vec![Ok(b"ok")])).await.unwrap();
        let err = sink
            .append(
                "bad.txt",
                stream_of(vec![Ok(b"partial"), Err(BlobError::Io("reset".into()))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Source(_)));
        sink.finalize().await.unwrap();

        let entries = read_zip(&tmp.path().join("out.zip"));
        assert_eq!(entries, vec![("good.txt".to_string(), "ok".to_string())]);
    }

    #[tokio::test]
    async fn appends_after_finalize_fail() {
        let tmp = TempDir::new().unwrap();
        let archiver = ZipArchiver::new(Arc::new(LocalBlobStore::new(tmp.path())));
        let sink = archiver.create("out.zip").await.unwrap();
        sink.finalize().await.unwrap();
        assert!(matches!(
            sink.append_bytes("late.txt", Bytes::new()).await,
            Err(ArchiveError::Finalized)
        ));
        assert!(matches!(sink.finalize().await, Err(ArchiveError::Finalized)));
    }

    /// Writer whose every write fails, like a full disk.
    struct FullDisk;

    impl std::io::Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl std::io::Seek for FullDisk {
        fn seek(&mut self, _pos: std::io::SeekFrom) -> std::io::Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn write_errors_surface_and_stick() {
        let sink = ZipArchiveSink::new(Box::new(FullDisk));
        let err = sink
            .append("a.txt", stream_of(vec![Ok(b"abc")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Write(_)), "{err:?}");
        assert!(matches!(
            sink.append_bytes("b.txt", Bytes::from_static(b"x")).await,
            Err(ArchiveError::Write(_))
        ));
        assert!(matches!(sink.finalize().await, Err(ArchiveError::Write(_))));
    }

    #[tokio::test]
    async fn streams_more_chunks_than_the_write_queue() {
        let tmp = TempDir::new().unwrap();
        let archiver = ZipArchiver::new(Arc::new(LocalBlobStore::new(tmp.path())));
        let sink = archiver.create("big.zip").await.unwrap();

        let parts = (0..WRITE_QUEUE * 4).map(|_| Ok(&b"0123456789"[..])).collect();
        let n = sink.append("big.txt", stream_of(parts)).await.unwrap();
        assert_eq!(n, (WRITE_QUEUE * 40) as u64);
        sink.finalize().await.unwrap();

        let entries = read_zip(&tmp.path().join("big.zip"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.len(), WRITE_QUEUE * 40);
    }

    #[tokio::test]
    async fn unmounted_root_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let archiver = ZipArchiver::new(Arc::new(LocalBlobStore::new(tmp.path().join("gone"))));
        assert!(matches!(
            archiver.create("out.zip").await,
            Err(ArchiveError::Unavailable(_))
        ));
    }
}
