//! In-memory implementation of [`FileGroupRepository`].
//!
//! Backed by `DashMap`s so it can be shared across workers without an outer
//! lock. Used by the CLI and tests; a real deployment plugs its document
//! store in through the same trait.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;
use waypoint_core::repository::group::FileGroupRepository;
use waypoint_types::error::RepositoryError;
use waypoint_types::group::{FileGroup, StoredFile};

#[derive(Default)]
pub struct InMemoryGroupRepository {
    groups: DashMap<Uuid, FileGroup>,
    files: DashMap<Uuid, StoredFile>,
    /// Blob path -> time it was flagged.
    deletions: DashMap<String, DateTime<Utc>>,
}

impl InMemoryGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_group(&self, group: FileGroup) {
        self.groups.insert(group.id, group);
    }

    /// Store a file and append it to its group.
    pub fn insert_file(&self, file: StoredFile) -> Result<(), RepositoryError> {
        let mut group = self
            .groups
            .get_mut(&file.group_id)
            .ok_or(RepositoryError::NotFound)?;
        if !group.file_ids.contains(&file.id) {
            group.file_ids.push(file.id);
        }
        self.files.insert(file.id, file);
        Ok(())
    }

    pub fn remove_group(&self, id: &Uuid) -> Option<FileGroup> {
        self.groups.remove(id).map(|(_, group)| group)
    }

    /// Snapshot of a group.
    pub fn group(&self, id: &Uuid) -> Option<FileGroup> {
        self.groups.get(id).map(|g| g.clone())
    }

    /// Blob paths flagged for deletion, sorted.
    pub fn pending_deletions(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.deletions.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

impl FileGroupRepository for InMemoryGroupRepository {
    async fn get_group(&self, id: &Uuid) -> Result<Option<FileGroup>, RepositoryError> {
        Ok(self.group(id))
    }

    async fn list_files(&self, group_id: &Uuid) -> Result<Vec<StoredFile>, RepositoryError> {
        let file_ids = self
            .groups
            .get(group_id)
            .map(|g| g.file_ids.clone())
            .ok_or(RepositoryError::NotFound)?;

        Ok(file_ids
            .iter()
            .filter_map(|id| self.files.get(id).map(|f| f.clone()))
            .collect())
    }

    async fn mark_needs_resync(&self, group_id: &Uuid) -> Result<(), RepositoryError> {
        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or(RepositoryError::NotFound)?;
        group.needs_resync = true;
        tracing::debug!(group_id = %group_id, "group flagged for resync");
        Ok(())
    }

    async fn mark_archived(
        &self,
        group_id: &Uuid,
        archive_path: &str,
        archived_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or(RepositoryError::NotFound)?;
        group.archive_path = Some(archive_path.to_string());
        group.archived_at = Some(archived_at);
        Ok(())
    }

    async fn flag_for_deletion(&self, blob_path: &str) -> Result<(), RepositoryError> {
        self.deletions.insert(blob_path.to_string(), Utc::now());
        Ok(())
    }
}
