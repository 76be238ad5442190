//! File group repository trait.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use waypoint_types::error::RepositoryError;
use waypoint_types::group::{FileGroup, StoredFile};

/// Document-store access for file groups and their files.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
/// Implementations live in waypoint-infra.
pub trait FileGroupRepository: Send + Sync {
    /// Fetch a group. `Ok(None)` when it no longer exists.
    fn get_group(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FileGroup>, RepositoryError>> + Send;

    /// Files referenced by a group, in the group's order. Ids with no
    /// stored-file record are skipped.
    fn list_files(
        &self,
        group_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StoredFile>, RepositoryError>> + Send;

    /// Flag a group whose file list disagrees with blob storage.
    fn mark_needs_resync(
        &self,
        group_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record a finished archive on the group.
    fn mark_archived(
        &self,
        group_id: &Uuid,
        archive_path: &str,
        archived_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Queue an orphaned blob for deletion.
    fn flag_for_deletion(
        &self,
        blob_path: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
