use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::document::{CanonicalRecord, RecordId};
use crate::error::{ExternalError, StorageError};
use crate::external::{RecordProvenance, RecordSink};

/// Writes each canonical record to `<output_directory>/<document id>.json`.
///
/// The file is written to a temporary sibling and renamed into place, so a
/// reader never sees a half-written record. Persisting the same document
/// again replaces the previous file.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    output_directory: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord<'a> {
    id: &'a str,
    stored_at: DateTime<Utc>,
    record: &'a CanonicalRecord,
    provenance: &'a RecordProvenance,
}

impl JsonFileSink {
    pub fn new<P: AsRef<Path>>(output_directory: P) -> Self {
        Self {
            output_directory: output_directory.as_ref().to_path_buf(),
        }
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.output_directory.join(format!("{}.json", id))
    }

    fn write_record(
        &self,
        record: &CanonicalRecord,
        provenance: &RecordProvenance,
    ) -> Result<PathBuf, StorageError> {
        self.ensure_directory(&self.output_directory)?;

        let id = provenance.document_id.as_str();
        let stored = StoredRecord {
            id,
            stored_at: Utc::now(),
            record,
            provenance,
        };
        let json = serde_json::to_vec_pretty(&stored)?;

        let final_path = self.record_path(id);
        let tmp_path = self
            .output_directory
            .join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &final_path)
        };

        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StorageError::WriteFile {
                path: final_path,
                source: e,
            });
        }

        Ok(final_path)
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl From<StorageError> for ExternalError {
    fn from(err: StorageError) -> Self {
        let io_kind = match &err {
            StorageError::CreateDirectory { source, .. } | StorageError::WriteFile { source, .. } => {
                Some(source.kind())
            }
            StorageError::Serialize(_) => None,
        };

        match io_kind {
            Some(std::io::ErrorKind::PermissionDenied)
            | Some(std::io::ErrorKind::AlreadyExists)
            | None => ExternalError::ConstraintViolation(err.to_string()),
            Some(_) => ExternalError::Unavailable(err.to_string()),
        }
    }
}

impl RecordSink for JsonFileSink {
    fn persist(
        &self,
        record: &CanonicalRecord,
        provenance: &RecordProvenance,
    ) -> Result<RecordId, ExternalError> {
        let _span = tracing::info_span!("store.json_file").entered();

        let path = self.write_record(record, provenance)?;
        tracing::debug!(
            "Stored record {} at {}",
            provenance.document_id.short(),
            crate::sanitize::redact_path(&path)
        );
        Ok(RecordId(provenance.document_id.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn provenance(id: &str) -> RecordProvenance {
        RecordProvenance {
            document_id: DocumentId::from_content_hash(id),
            source_path: PathBuf::from("/plans/house.pdf"),
            sources: BTreeMap::new(),
        }
    }

    fn record(address: &str) -> CanonicalRecord {
        CanonicalRecord {
            address: Some(address.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_persist_writes_json_named_by_id() {
        let dir = TempDir::new().unwrap();
        let sink = JsonFileSink::new(dir.path().join("records"));

        let id = sink
            .persist(&record("123 Main St"), &provenance("abc123"))
            .unwrap();
        assert_eq!(id, RecordId("abc123".to_string()));

        let content = std::fs::read_to_string(sink.record_path("abc123")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["id"], "abc123");
        assert_eq!(json["record"]["address"], "123 Main St");
        assert_eq!(json["provenance"]["sourcePath"], "/plans/house.pdf");
        assert!(json["storedAt"].is_string());
    }

    #[test]
    fn test_persist_is_idempotent_per_document() {
        let dir = TempDir::new().unwrap();
        let sink = JsonFileSink::new(dir.path());

        sink.persist(&record("1 First Ave"), &provenance("doc")).unwrap();
        sink.persist(&record("2 Second Ave"), &provenance("doc")).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);

        let content = std::fs::read_to_string(sink.record_path("doc")).unwrap();
        assert!(content.contains("2 Second Ave"));
    }

    #[test]
    fn test_output_path_occupied_by_file_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("records");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let sink = JsonFileSink::new(&blocker);
        let err = sink.persist(&record("x"), &provenance("doc")).unwrap_err();
        assert!(matches!(
            err,
            ExternalError::ConstraintViolation(_) | ExternalError::Unavailable(_)
        ));
    }

    #[test]
    fn test_storage_error_mapping() {
        let denied = StorageError::WriteFile {
            path: PathBuf::from("/x"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(matches!(
            ExternalError::from(denied),
            ExternalError::ConstraintViolation(_)
        ));

        let busy = StorageError::WriteFile {
            path: PathBuf::from("/x"),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk"),
        };
        assert!(matches!(
            ExternalError::from(busy),
            ExternalError::Unavailable(_)
        ));
    }
}
