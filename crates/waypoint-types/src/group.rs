//! File groups and the stored files that belong to them.
//!
//! These are the domain records the archive step reads and updates through
//! the document store. The engine itself never touches them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A file held in blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: Uuid,
    pub group_id: Uuid,
    /// Display name, used as the archive entry name.
    pub name: String,
    /// Location of the bytes in blob storage.
    pub blob_path: String,
    pub size_bytes: u64,
}

/// A set of related files that can be archived together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    pub id: Uuid,
    pub name: String,
    pub file_ids: Vec<Uuid>,
    /// Blob path of the latest finished archive.
    pub archive_path: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Set when the group's file list disagrees with blob storage.
    pub needs_resync: bool,
    pub created_at: DateTime<Utc>,
}

impl FileGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            file_ids: Vec::new(),
            archive_path: None,
            archived_at: None,
            needs_resync: false,
            created_at: Utc::now(),
        }
    }
}

/// One archived entry, as listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_id: Uuid,
    pub entry_name: String,
    pub bytes: u64,
}

/// Contents of the optional `manifest.json` appended to an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub group_id: Uuid,
    pub group_name: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
    /// Files that could not be read from blob storage.
    pub missing: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_group_is_unarchived() {
        let group = FileGroup::new("reports");
        assert_eq!(group.name, "reports");
        assert!(group.archive_path.is_none());
        assert!(group.archived_at.is_none());
        assert!(!group.needs_resync);
    }

    #[test]
    fn manifest_serialize() {
        let manifest = ArchiveManifest {
            group_id: Uuid::nil(),
            group_name: "g".to_string(),
            generated_at: Utc::now(),
            entries: vec![ManifestEntry {
                file_id: Uuid::nil(),
                entry_name: "a.txt".to_string(),
                bytes: 3,
            }],
            missing: vec![],
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"entry_name\":\"a.txt\""));
        assert!(json.contains("\"missing\":[]"));
    }
}
