use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use veriface_core::RegisteredIdentity;

const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("identity store {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("identity store {path} has unsupported format version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    identities: Vec<RegisteredIdentity>,
}

/// Registered identities persisted as a single JSON document.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all identities. A missing file is an empty population.
    pub fn load(&self) -> Result<Vec<RegisteredIdentity>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %self.path.display(),
                    "no identity store yet; starting empty"
                );
                return Ok(Vec::new());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let file: StoreFile = serde_json::from_str(&text).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        if file.version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: self.path.clone(),
                version: file.version,
            });
        }

        tracing::info!(
            path = %self.path.display(),
            identities = file.identities.len(),
            "identity store loaded"
        );
        Ok(file.identities)
    }

    /// Replace the stored identities. Writes a sibling temp file and renames it
    /// over the store so readers never see a partial document.
    pub fn save(&self, identities: &[RegisteredIdentity]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let file = StoreFile {
            version: FORMAT_VERSION,
            identities: identities.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        tracing::debug!(
            path = %self.path.display(),
            identities = identities.len(),
            "identity store saved"
        );
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veriface_core::{Embedding, EMBEDDING_DIM};

    fn identity(id: &str, value: f32) -> RegisteredIdentity {
        RegisteredIdentity {
            identity_id: id.into(),
            embedding: Embedding::new(vec![value; EMBEDDING_DIM]).unwrap(),
            registered_at: Some("2026-10-19T08:00:00+00:00".into()),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("identities.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("nested/identities.json"));
        let identities = vec![identity("alice", 0.1), identity("bob", -0.1)];

        store.save(&identities).unwrap();
        assert_eq!(store.load().unwrap(), identities);
        assert!(!dir.path().join("nested/identities.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            IdentityStore::new(&path).load(),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_wrong_length_embedding_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        std::fs::write(
            &path,
            r#"{"version":1,"identities":[{"identityId":"x","embedding":[0.1,0.2]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            IdentityStore::new(&path).load(),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.json");
        std::fs::write(&path, r#"{"version":7,"identities":[]}"#).unwrap();
        assert!(matches!(
            IdentityStore::new(&path).load(),
            Err(StoreError::UnsupportedVersion { version: 7, .. })
        ));
    }
}
