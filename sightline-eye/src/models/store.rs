//! Model and label files on disk

use crate::error::VisionError;
use crate::models::LabelTable;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MAX_FILE_NAME: usize = 255;

/// Model bytes plus labels, ready to hand to a backend
#[derive(Clone)]
pub struct ModelSource {
    pub name: String,
    pub bytes: Vec<u8>,
    pub labels: LabelTable,
}

impl ModelSource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, labels: LabelTable) -> Self {
        Self {
            name: name.into(),
            bytes,
            labels,
        }
    }
}

impl std::fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSource")
            .field("name", &self.name)
            .field("bytes", &self.bytes.len())
            .field("labels", &self.labels.len())
            .finish()
    }
}

/// Resolves model and label files inside a single model directory
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `file_name` inside the model directory
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf, VisionError> {
        if file_name.is_empty() || file_name.len() > MAX_FILE_NAME {
            return Err(VisionError::model_load(file_name, "invalid file name"));
        }
        if file_name.contains("..") || file_name.contains('/') || file_name.contains('\\') {
            return Err(VisionError::model_load(file_name, "file name contains path separators"));
        }

        let path = self.root.join(file_name);
        if !path.starts_with(&self.root) {
            return Err(VisionError::model_load(file_name, "path traversal detected"));
        }
        Ok(path)
    }

    /// Read model bytes, verifying the SHA-256 digest when one is given
    pub fn read_model(&self, file_name: &str, checksum: Option<&str>) -> Result<Vec<u8>, VisionError> {
        let path = self.resolve(file_name)?;
        let bytes = fs::read(&path).map_err(|e| VisionError::model_load(file_name, e))?;
        if bytes.is_empty() {
            return Err(VisionError::model_load(file_name, "model file is empty"));
        }

        match checksum {
            Some(expected) => {
                verify_checksum(&bytes, expected).map_err(|reason| VisionError::model_load(file_name, reason))?;
                info!("Verified checksum for model {}", file_name);
            }
            None => debug!("Read {} bytes for model {} (checksum verification skipped)", bytes.len(), file_name),
        }
        Ok(bytes)
    }

    pub fn read_labels(&self, file_name: &str) -> Result<LabelTable, VisionError> {
        let path = self.resolve(file_name)?;
        let content = fs::read_to_string(&path).map_err(|e| VisionError::model_load(file_name, e))?;
        let labels = LabelTable::parse(&content);
        if labels.is_empty() {
            return Err(VisionError::model_load(file_name, "label file has no labels"));
        }
        Ok(labels)
    }

    /// Read a model and its label file into a [`ModelSource`]
    pub fn load_source(
        &self,
        model_file: &str,
        labels_file: &str,
        checksum: Option<&str>,
    ) -> Result<ModelSource, VisionError> {
        let bytes = self.read_model(model_file, checksum)?;
        let labels = self.read_labels(labels_file)?;
        Ok(ModelSource::new(model_file, bytes, labels))
    }
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), String> {
    let computed = sha256_hex(bytes);
    if computed.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(format!("checksum mismatch: expected {}, got {}", expected, computed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(files: &[(&str, &[u8])]) -> (TempDir, ModelStore) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let store = ModelStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let store = ModelStore::new("/tmp/models");
        assert!(store.resolve("").is_err());
        assert!(store.resolve("../evil.onnx").is_err());
        assert!(store.resolve("sub/model.onnx").is_err());
        assert!(store.resolve("sub\\model.onnx").is_err());
        assert_eq!(
            store.resolve("yolo.onnx").unwrap(),
            PathBuf::from("/tmp/models/yolo.onnx")
        );
    }

    #[test]
    fn test_load_source() {
        let (_dir, store) = store_with(&[
            ("detector.onnx", b"weights"),
            ("detector.txt", b"# header\nperson\ncar\n"),
        ]);
        let source = store.load_source("detector.onnx", "detector.txt", None).unwrap();
        assert_eq!(source.bytes, b"weights");
        assert_eq!(source.labels.len(), 2);
        assert_eq!(source.name, "detector.onnx");
    }

    #[test]
    fn test_checksum_verification() {
        let (_dir, store) = store_with(&[("m.onnx", b"weights")]);
        let digest = sha256_hex(b"weights");
        assert!(store.read_model("m.onnx", Some(&digest)).is_ok());
        assert!(store.read_model("m.onnx", Some(&digest.to_uppercase())).is_ok());

        let err = store.read_model("m.onnx", Some("00ff")).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_missing_and_empty_files() {
        let (_dir, store) = store_with(&[("empty.onnx", b""), ("empty.txt", b"# nothing\n")]);
        assert!(matches!(
            store.read_model("absent.onnx", None),
            Err(VisionError::ModelLoad { .. })
        ));
        assert!(store.read_model("empty.onnx", None).is_err());
        assert!(store.read_labels("empty.txt").is_err());
    }
}
