//! Filesystem-backed instance metadata.
//!
//! Stored instances keep their attribute set as DICOM JSON under
//! `{root}/{study}/{series}/{sop}_{watermark}.json`. The watermark in the
//! file name keeps re-ingested versions of one instance apart.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::trace;

use dicom_core::{
    Error, InstanceMetadata, InstanceMetadataStore, Result, VersionedInstanceIdentifier,
};

/// Reads instance metadata from a directory tree.
#[derive(Debug, Clone)]
pub struct FilesystemMetadataStore {
    root: PathBuf,
}

impl FilesystemMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of one instance's metadata file.
    pub fn metadata_path(&self, instance: &VersionedInstanceIdentifier) -> Result<PathBuf> {
        let id = &instance.identifier;
        for uid in [
            &id.study_instance_uid,
            &id.series_instance_uid,
            &id.sop_instance_uid,
        ] {
            check_uid_segment(uid)?;
        }
        Ok(self
            .root
            .join(&id.study_instance_uid)
            .join(&id.series_instance_uid)
            .join(format!("{}_{}.json", id.sop_instance_uid, instance.watermark)))
    }

    /// Write an instance's metadata, creating parent directories.
    pub async fn put_instance_metadata(
        &self,
        instance: &VersionedInstanceIdentifier,
        metadata: &InstanceMetadata,
    ) -> Result<()> {
        let path = self.metadata_path(instance)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(metadata)?;
        fs::write(&path, bytes).await?;
        Ok(())
    }
}

/// UIDs become path segments, so they must not escape the root.
fn check_uid_segment(uid: &str) -> Result<()> {
    let valid = !uid.is_empty()
        && uid != "."
        && uid != ".."
        && uid.chars().all(|c| c.is_ascii_alphanumeric() || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "'{}' is not usable as a metadata path segment",
            uid
        )))
    }
}

#[async_trait]
impl InstanceMetadataStore for FilesystemMetadataStore {
    async fn get_instance_metadata(
        &self,
        instance: &VersionedInstanceIdentifier,
    ) -> Result<InstanceMetadata> {
        let path = self.metadata_path(instance)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("metadata for {}", instance)));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        trace!(
            subsystem = "jobs",
            component = "metadata_store",
            op = "get_instance_metadata",
            watermark = instance.watermark,
            bytes = bytes.len(),
            "Read instance metadata"
        );
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::InstanceIdentifier;
    use serde_json::json;
    use tempfile::TempDir;

    fn instance(watermark: i64) -> VersionedInstanceIdentifier {
        VersionedInstanceIdentifier::new(
            InstanceIdentifier::new("1.2.840", "1.2.840.1", "1.2.840.1.7"),
            watermark,
        )
    }

    #[test]
    fn test_metadata_path_layout() {
        let store = FilesystemMetadataStore::new("/data");
        let path = store.metadata_path(&instance(42)).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/data/1.2.840/1.2.840.1/1.2.840.1.7_42.json")
        );
    }

    #[test]
    fn test_metadata_path_rejects_traversal() {
        let store = FilesystemMetadataStore::new("/data");
        let bad = VersionedInstanceIdentifier::new(
            InstanceIdentifier::new("..", "1.2", "1.2.3"),
            1,
        );
        assert!(matches!(
            store.metadata_path(&bad),
            Err(Error::InvalidInput(_))
        ));
        let bad = VersionedInstanceIdentifier::new(
            InstanceIdentifier::new("1.2", "1/2", "1.2.3"),
            1,
        );
        assert!(store.metadata_path(&bad).is_err());
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        let mut metadata = InstanceMetadata::default();
        metadata.insert("00101010", "AS", vec![json!("042Y")]);

        store
            .put_instance_metadata(&instance(3), &metadata)
            .await
            .unwrap();
        let loaded = store.get_instance_metadata(&instance(3)).await.unwrap();
        assert_eq!(loaded, metadata);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        let err = store.get_instance_metadata(&instance(9)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_file_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        let path = store.metadata_path(&instance(1)).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        let err = store.get_instance_metadata(&instance(1)).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
