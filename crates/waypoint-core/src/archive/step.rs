//! Subtask step that archives one file group.
//!
//! Source files are streamed into the archive through a [`WorkerPool`]
//! sized by `archive.max_parallel_files`, so only that many sources are
//! open at once and no file is buffered whole. A source that is gone or
//! unreadable is skipped and the group is flagged for resync; write-side
//! failures abort the step and the scheduler retries it.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;
use waypoint_types::cleanup::RetryAt;
use waypoint_types::config::ArchiveConfig;
use waypoint_types::group::{ArchiveManifest, FileGroup, ManifestEntry, StoredFile};
use waypoint_types::subtask::SubtaskOutcome;
use waypoint_types::task::Task;

use super::{ArchiveError, ArchiveFactory, ArchiveSink, MANIFEST_ENTRY, unique_entry_names};
use crate::engine::flow::FlowError;
use crate::engine::step::StepError;
use crate::engine::subtask::{BoxSubtaskStep, SubtaskInput, SubtaskProcessor, SubtaskStep};
use crate::pool::WorkerPool;
use crate::repository::group::FileGroupRepository;
use crate::storage::blob_store::BlobStore;

/// Target name the archive processor is registered under.
pub const ARCHIVE_TARGET: &str = "group_archive";

/// The single subtask of the archive processor.
pub const ARCHIVE_SUBTASK: &str = "archive";

/// What to archive, read from `Task.data.archive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub group_id: Uuid,
    /// Blob path the archive is written to.
    pub output_path: String,
}

impl ArchiveRequest {
    pub fn from_task(task: &Task) -> Result<Self, StepError> {
        let raw = task.data.get("archive").ok_or_else(|| {
            StepError::MissingRequiredData("task carries no archive request".to_string())
        })?;
        Ok(serde_json::from_value(raw.clone())?)
    }

    /// Initial task data for an archive task.
    pub fn to_task_data(&self) -> Value {
        json!({ "target": ARCHIVE_TARGET, "archive": self })
    }
}

enum FileOutcome {
    Appended(u64),
    Missing(String),
}

pub struct ArchiveGroupStep<R, B, A> {
    groups: Arc<R>,
    blobs: Arc<B>,
    archiver: A,
    config: ArchiveConfig,
}

impl<R, B, A> ArchiveGroupStep<R, B, A>
where
    R: FileGroupRepository + 'static,
    B: BlobStore + 'static,
    A: ArchiveFactory + 'static,
{
    pub fn new(groups: Arc<R>, blobs: Arc<B>, archiver: A, config: ArchiveConfig) -> Self {
        Self {
            groups,
            blobs,
            archiver,
            config,
        }
    }

    /// Wrap this step in a one-subtask processor for [`ARCHIVE_TARGET`].
    ///
    /// Cleanup may chain straight after the archive in the same delivery.
    pub fn into_processor(self) -> Result<SubtaskProcessor, FlowError> {
        SubtaskProcessor::builder(ARCHIVE_TARGET)
            .subtask(ARCHIVE_SUBTASK, BoxSubtaskStep::new(self))
            .allow_run_multiple_parts(true)
            .build()
    }

    async fn archive(&self, request: &ArchiveRequest) -> Result<SubtaskOutcome, StepError> {
        let Some(group) = self.groups.get_group(&request.group_id).await? else {
            tracing::warn!(
                group_id = %request.group_id,
                output_path = request.output_path.as_str(),
                "file group no longer exists, flagging output for deletion"
            );
            self.groups.flag_for_deletion(&request.output_path).await?;
            return Err(StepError::MissingRequiredData(format!(
                "file group {} not found",
                request.group_id
            )));
        };

        let files = self.groups.list_files(&group.id).await?;

        let sink = match self.archiver.create(&request.output_path).await {
            Ok(sink) => Arc::new(sink),
            Err(ArchiveError::Unavailable(reason)) => {
                let delay = self.config.unavailable_retry_delay();
                let at = RetryAt::AfterMillis(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
                    .resolve(Utc::now());
                tracing::warn!(
                    group_id = %group.id,
                    reason = reason.as_str(),
                    retry_at = %at,
                    "archive output unavailable, retrying later"
                );
                return Ok(SubtaskOutcome::unchanged().with_delay_until(at));
            }
            Err(e) => return Err(e.into()),
        };

        let reserved: &[&str] = if self.config.include_manifest {
            &[MANIFEST_ENTRY]
        } else {
            &[]
        };
        let entry_names = unique_entry_names(files.iter().map(|f| f.name.as_str()), reserved);
        let jobs: Vec<(StoredFile, String)> = files.into_iter().zip(entry_names).collect();

        tracing::debug!(
            group_id = %group.id,
            files = jobs.len(),
            parallelism = self.config.parallelism(),
            "archiving file group"
        );

        let pool = WorkerPool::new(self.config.parallelism());
        let results = pool
            .run(jobs, {
                let blobs = Arc::clone(&self.blobs);
                let sink = Arc::clone(&sink);
                move |(file, entry): (StoredFile, String)| {
                    let blobs = Arc::clone(&blobs);
                    let sink = Arc::clone(&sink);
                    async move {
                        let outcome = append_file(blobs.as_ref(), sink.as_ref(), &file, &entry).await;
                        (file, entry, outcome)
                    }
                }
            })
            .await
            .map_err(|e| StepError::ExecutionFailed(e.to_string()))?;

        let mut entries = Vec::with_capacity(results.len());
        let mut missing = unlisted_files(&group, &results);
        for (file, entry_name, outcome) in results {
            match outcome? {
                FileOutcome::Appended(bytes) => entries.push(ManifestEntry {
                    file_id: file.id,
                    entry_name,
                    bytes,
                }),
                FileOutcome::Missing(reason) => {
                    tracing::warn!(
                        group_id = %group.id,
                        file_id = %file.id,
                        blob_path = file.blob_path.as_str(),
                        reason = reason.as_str(),
                        "source file missing, skipping"
                    );
                    missing.push(file.id);
                }
            }
        }

        if !missing.is_empty() {
            self.groups.mark_needs_resync(&group.id).await?;
        }

        if self.config.include_manifest {
            let manifest = ArchiveManifest {
                group_id: group.id,
                group_name: group.name.clone(),
                generated_at: Utc::now(),
                entries: entries.clone(),
                missing: missing.clone(),
            };
            let body = serde_json::to_vec_pretty(&manifest)?;
            sink.append_bytes(MANIFEST_ENTRY, body.into()).await?;
        }

        let summary = sink.finalize().await?;
        self.groups
            .mark_archived(&group.id, &request.output_path, Utc::now())
            .await?;

        tracing::info!(
            group_id = %group.id,
            output_path = request.output_path.as_str(),
            archived = entries.len(),
            missing = missing.len(),
            bytes_written = summary.bytes_written,
            "file group archived"
        );

        Ok(SubtaskOutcome::done().with_metadata(json!({
            "archive_path": request.output_path,
            "archived_files": entries.len(),
            "missing_files": missing.len(),
            "bytes_written": summary.bytes_written,
        })))
    }
}

impl<R, B, A> SubtaskStep for ArchiveGroupStep<R, B, A>
where
    R: FileGroupRepository + 'static,
    B: BlobStore + 'static,
    A: ArchiveFactory + 'static,
{
    async fn run(&self, input: &SubtaskInput) -> Result<SubtaskOutcome, StepError> {
        let request = ArchiveRequest::from_task(&input.task)?;
        self.archive(&request).await
    }
}

/// Group members with no stored-file record.
fn unlisted_files<T>(group: &FileGroup, results: &[(StoredFile, String, T)]) -> Vec<Uuid> {
    group
        .file_ids
        .iter()
        .filter(|id| !results.iter().any(|(file, _, _)| file.id == **id))
        .copied()
        .collect()
}

/// Stream one source into the archive.
///
/// Unreadable sources come back as [`FileOutcome::Missing`]. An unreachable
/// blob backend or a failed write is an error.
async fn append_file<B: BlobStore, S: ArchiveSink>(
    blobs: &B,
    sink: &S,
    file: &StoredFile,
    entry_name: &str,
) -> Result<FileOutcome, StepError> {
    match blobs.exists(&file.blob_path).await {
        Ok(true) => {}
        Ok(false) => return Ok(FileOutcome::Missing("not in blob storage".to_string())),
        Err(e) if e.is_unavailable() => return Err(e.into()),
        Err(e) => return Ok(FileOutcome::Missing(e.to_string())),
    }

    let stream = match blobs.get_stream(&file.blob_path).await {
        Ok(stream) => stream,
        Err(e) if e.is_unavailable() => return Err(e.into()),
        Err(e) => return Ok(FileOutcome::Missing(e.to_string())),
    };

    match sink.append(entry_name, stream).await {
        Ok(bytes) => Ok(FileOutcome::Appended(bytes)),
        Err(ArchiveError::Source(e)) if !e.is_unavailable() => {
            Ok(FileOutcome::Missing(e.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::DateTime;
    use futures_util::StreamExt;
    use waypoint_types::completion::Completion;
    use waypoint_types::error::{BlobError, RepositoryError};

    use crate::archive::ArchiveSummary;
    use crate::storage::blob_store::{BlobWriter, ByteStream};

    // -- repository ---------------------------------------------------------

    #[derive(Default)]
    struct MockGroups {
        groups: Mutex<HashMap<Uuid, FileGroup>>,
        files: Mutex<HashMap<Uuid, StoredFile>>,
        flagged: Mutex<Vec<String>>,
        resynced: Mutex<Vec<Uuid>>,
        archived: Mutex<Vec<(Uuid, String)>>,
    }

    impl MockGroups {
        fn with_group(file_names: &[&str]) -> (Self, FileGroup) {
            let repo = Self::default();
            let mut group = FileGroup::new("reports");
            for name in file_names {
                let file = StoredFile {
                    id: Uuid::now_v7(),
                    group_id: group.id,
                    name: name.to_string(),
                    blob_path: format!("blobs/{name}"),
                    size_bytes: 0,
                };
                group.file_ids.push(file.id);
                repo.files.lock().unwrap().insert(file.id, file);
            }
            repo.groups.lock().unwrap().insert(group.id, group.clone());
            (repo, group)
        }
    }

    impl FileGroupRepository for MockGroups {
        async fn get_group(&self, id: &Uuid) -> Result<Option<FileGroup>, RepositoryError> {
            Ok(self.groups.lock().unwrap().get(id).cloned())
        }

        async fn list_files(&self, group_id: &Uuid) -> Result<Vec<StoredFile>, RepositoryError> {
            let groups = self.groups.lock().unwrap();
            let files = self.files.lock().unwrap();
            let group = groups.get(group_id).ok_or(RepositoryError::NotFound)?;
            Ok(group
                .file_ids
                .iter()
                .filter_map(|id| files.get(id).cloned())
                .collect())
        }

        async fn mark_needs_resync(&self, group_id: &Uuid) -> Result<(), RepositoryError> {
            self.resynced.lock().unwrap().push(*group_id);
            Ok(())
        }

        async fn mark_archived(
            &self,
            group_id: &Uuid,
            archive_path: &str,
            _archived_at: DateTime<Utc>,
        ) -> Result<(), RepositoryError> {
            self.archived
                .lock()
                .unwrap()
                .push((*group_id, archive_path.to_string()));
            Ok(())
        }

        async fn flag_for_deletion(&self, blob_path: &str) -> Result<(), RepositoryError> {
            self.flagged.lock().unwrap().push(blob_path.to_string());
            Ok(())
        }
    }

    // -- blobs --------------------------------------------------------------

    #[derive(Default)]
    struct MockBlobs {
        blobs: HashMap<String, Vec<u8>>,
        /// Paths whose stream fails after the first chunk.
        broken: Vec<String>,
    }

    impl MockBlobs {
        fn holding(names: &[&str]) -> Self {
            Self {
                blobs: names
                    .iter()
                    .map(|n| (format!("blobs/{n}"), format!("contents of {n}").into_bytes()))
                    .collect(),
                broken: Vec::new(),
            }
        }
    }

    impl BlobStore for MockBlobs {
        async fn exists(&self, path: &str) -> Result<bool, BlobError> {
            Ok(self.blobs.contains_key(path))
        }

        async fn get_stream(&self, path: &str) -> Result<ByteStream, BlobError> {
            let data = self
                .blobs
                .get(path)
                .cloned()
                .ok_or_else(|| BlobError::NotFound(path.to_string()))?;
            let mut chunks: Vec<Result<Bytes, BlobError>> =
                data.chunks(4).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
            if self.broken.iter().any(|p| p == path) {
                chunks.truncate(1);
                chunks.push(Err(BlobError::Io("connection reset".to_string())));
            }
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }

        async fn upload_stream(&self, path: &str) -> Result<BlobWriter, BlobError> {
            Err(BlobError::InvalidPath(path.to_string()))
        }
    }

    // -- archive sink -------------------------------------------------------

    #[derive(Default)]
    struct SinkState {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        entries: Mutex<Vec<String>>,
        bytes: AtomicUsize,
        appended_at_finalize: Mutex<Option<usize>>,
    }

    struct MockSink(Arc<SinkState>);

    impl ArchiveSink for MockSink {
        async fn append(&self, entry_name: &str, mut stream: ByteStream) -> Result<u64, ArchiveError> {
            let state = &self.0;
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak.fetch_max(now, Ordering::SeqCst);

            let mut written = 0u64;
            let result = loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        written += chunk.len() as u64;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    Some(Err(e)) => break Err(ArchiveError::Source(e)),
                    None => break Ok(written),
                }
            };

            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            if result.is_ok() {
                state.entries.lock().unwrap().push(entry_name.to_string());
                state.bytes.fetch_add(written as usize, Ordering::SeqCst);
            }
            result
        }

        async fn append_bytes(&self, entry_name: &str, bytes: Bytes) -> Result<u64, ArchiveError> {
            self.0.entries.lock().unwrap().push(entry_name.to_string());
            self.0.bytes.fetch_add(bytes.len(), Ordering::SeqCst);
            Ok(bytes.len() as u64)
        }

        async fn finalize(&self) -> Result<ArchiveSummary, ArchiveError> {
            assert_eq!(self.0.in_flight.load(Ordering::SeqCst), 0);
            let entries = self.0.entries.lock().unwrap().len();
            *self.0.appended_at_finalize.lock().unwrap() = Some(entries);
            Ok(ArchiveSummary {
                entries,
                bytes_written: self.0.bytes.load(Ordering::SeqCst) as u64,
            })
        }
    }

    struct MockArchiver {
        state: Arc<SinkState>,
        unavailable: bool,
    }

    impl ArchiveFactory for MockArchiver {
        type Sink = MockSink;

        async fn create(&self, _path: &str) -> Result<MockSink, ArchiveError> {
            if self.unavailable {
                return Err(ArchiveError::Unavailable("bucket offline".to_string()));
            }
            Ok(MockSink(Arc::clone(&self.state)))
        }
    }

    // -- helpers ------------------------------------------------------------

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("file-{i}.txt")).collect()
    }

    fn input_for(group_id: Uuid) -> SubtaskInput {
        let request = ArchiveRequest {
            group_id,
            output_path: "archives/out.zip".to_string(),
        };
        SubtaskInput {
            task: Task::new("group_archive", request.to_task_data()),
            target: ARCHIVE_TARGET.to_string(),
            completed_subtasks: Default::default(),
            subtask_metadata: Default::default(),
        }
    }

    fn step(
        groups: Arc<MockGroups>,
        blobs: MockBlobs,
        archiver: MockArchiver,
    ) -> ArchiveGroupStep<MockGroups, MockBlobs, MockArchiver> {
        ArchiveGroupStep::new(groups, Arc::new(blobs), archiver, ArchiveConfig::default())
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn ten_files_at_most_three_in_flight() {
        let names = names(10);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (groups, group) = MockGroups::with_group(&refs);
        let groups = Arc::new(groups);
        let state = Arc::new(SinkState::default());
        let step = step(
            Arc::clone(&groups),
            MockBlobs::holding(&refs),
            MockArchiver {
                state: Arc::clone(&state),
                unavailable: false,
            },
        );

        let outcome = step.run(&input_for(group.id)).await.unwrap();

        assert_eq!(outcome.completion, Completion::Done);
        assert!(state.peak.load(Ordering::SeqCst) <= 3);
        assert!(state.peak.load(Ordering::SeqCst) >= 2);

        let entries = state.entries.lock().unwrap().clone();
        assert_eq!(entries.len(), 11);
        for name in &names {
            assert_eq!(entries.iter().filter(|e| *e == name).count(), 1);
        }
        assert_eq!(entries.last().map(String::as_str), Some(MANIFEST_ENTRY));
        assert_eq!(*state.appended_at_finalize.lock().unwrap(), Some(11));

        let metadata = outcome.metadata.unwrap();
        assert_eq!(metadata["archived_files"], 10);
        assert_eq!(metadata["missing_files"], 0);
        assert_eq!(metadata["archive_path"], "archives/out.zip");
        assert_eq!(
            groups.archived.lock().unwrap().as_slice(),
            &[(group.id, "archives/out.zip".to_string())]
        );
        assert!(groups.resynced.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_sources_flag_resync_but_archive_completes() {
        let (groups, group) = MockGroups::with_group(&["a.txt", "b.txt", "c.txt", "d.txt"]);
        let groups = Arc::new(groups);
        // b.txt vanished from blob storage, c.txt breaks mid-read.
        let mut blobs = MockBlobs::holding(&["a.txt", "c.txt", "d.txt"]);
        blobs.broken.push("blobs/c.txt".to_string());
        let state = Arc::new(SinkState::default());
        let step = step(
            Arc::clone(&groups),
            blobs,
            MockArchiver {
                state: Arc::clone(&state),
                unavailable: false,
            },
        );

        let outcome = step.run(&input_for(group.id)).await.unwrap();

        assert_eq!(outcome.completion, Completion::Done);
        let metadata = outcome.metadata.unwrap();
        assert_eq!(metadata["archived_files"], 2);
        assert_eq!(metadata["missing_files"], 2);
        assert_eq!(groups.resynced.lock().unwrap().as_slice(), &[group.id]);
        assert_eq!(groups.archived.lock().unwrap().len(), 1);
        let entries = state.entries.lock().unwrap().clone();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn vanished_group_flags_output_and_completes() {
        let groups = Arc::new(MockGroups::default());
        let step = step(
            Arc::clone(&groups),
            MockBlobs::default(),
            MockArchiver {
                state: Arc::default(),
                unavailable: false,
            },
        );

        let err = step.run(&input_for(Uuid::now_v7())).await.unwrap_err();
        assert!(err.is_missing_required_data());
        assert_eq!(
            groups.flagged.lock().unwrap().as_slice(),
            &["archives/out.zip".to_string()]
        );
    }

    #[tokio::test]
    async fn unavailable_output_delays_without_failing() {
        let (groups, group) = MockGroups::with_group(&["a.txt"]);
        let before = Utc::now();
        let step = step(
            Arc::new(groups),
            MockBlobs::holding(&["a.txt"]),
            MockArchiver {
                state: Arc::default(),
                unavailable: true,
            },
        );

        let outcome = step.run(&input_for(group.id)).await.unwrap();
        assert_eq!(outcome.completion, Completion::DelayedNoChange);
        let at = outcome.delay_until.unwrap();
        assert!(at >= before + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn task_without_request_is_missing_data() {
        let step = step(
            Arc::new(MockGroups::default()),
            MockBlobs::default(),
            MockArchiver {
                state: Arc::default(),
                unavailable: false,
            },
        );
        let mut input = input_for(Uuid::now_v7());
        input.task.data = json!({"target": ARCHIVE_TARGET});
        let err = step.run(&input).await.unwrap_err();
        assert!(err.is_missing_required_data());
    }

    #[tokio::test]
    async fn duplicate_names_and_no_manifest() {
        let (groups, group) = MockGroups::with_group(&["same.txt", "same.txt"]);
        // Both records point at the same blob path, which is fine for reads.
        let state = Arc::new(SinkState::default());
        let step = ArchiveGroupStep::new(
            Arc::new(groups),
            Arc::new(MockBlobs::holding(&["same.txt"])),
            MockArchiver {
                state: Arc::clone(&state),
                unavailable: false,
            },
            ArchiveConfig {
                include_manifest: false,
                ..ArchiveConfig::default()
            },
        );

        step.run(&input_for(group.id)).await.unwrap();
        let mut entries = state.entries.lock().unwrap().clone();
        entries.sort();
        assert_eq!(entries, vec!["same (2).txt", "same.txt"]);
    }

    #[test]
    fn processor_has_single_subtask() {
        let step = step(
            Arc::new(MockGroups::default()),
            MockBlobs::default(),
            MockArchiver {
                state: Arc::default(),
                unavailable: false,
            },
        );
        let processor = step.into_processor().unwrap();
        assert_eq!(processor.target(), ARCHIVE_TARGET);
        assert_eq!(processor.universe().to_vec(), vec![ARCHIVE_SUBTASK.to_string()]);
        assert!(processor.allow_run_multiple_parts());
    }
}
