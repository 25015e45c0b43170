//! Durable per-run artifacts: phase outputs and test file versions.
//!
//! Layout under the store root:
//!
//! ```text
//! <run-id>/phases/<phase>.json          committed phase output
//! <run-id>/tests/<file>                 current test suite
//! <run-id>/healing/attempt-<k>/<file>   suite snapshot after healing attempt k
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use super::models::{GeneratedFile, Phase, RunId};

/// Files of the live test suite.
pub const SUITE_KEY: &str = "tests";

pub fn healing_snapshot_key(attempt: u32) -> String {
    format!("healing/attempt-{}", attempt)
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a phase's canonical output. Must be durable when this returns.
    async fn save_phase_output(
        &self,
        run_id: RunId,
        phase: Phase,
        output: &serde_json::Value,
    ) -> Result<()>;

    /// Store a set of test files under `key`, replacing same-named files.
    async fn save_files(&self, run_id: RunId, key: &str, files: &[GeneratedFile]) -> Result<()>;

    /// Load every file stored under `key`, sorted by name.
    async fn load_files(&self, run_id: RunId, key: &str) -> Result<Vec<GeneratedFile>>;
}

/// Local directory implementation of [`ArtifactStore`].
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn key_dir(&self, run_id: RunId, key: &str) -> Result<PathBuf> {
        let mut dir = self.run_dir(run_id);
        for segment in key.split('/') {
            dir.push(checked_name(segment)?);
        }
        Ok(dir)
    }
}

/// Reject names that would escape the run directory.
fn checked_name(name: &str) -> Result<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0')
    {
        bail!("Invalid artifact name '{}'", name);
    }
    Ok(name)
}

/// Write via a temp file and rename so readers never see a partial file.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save_phase_output(
        &self,
        run_id: RunId,
        phase: Phase,
        output: &serde_json::Value,
    ) -> Result<()> {
        let path = self
            .run_dir(run_id)
            .join("phases")
            .join(format!("{}.json", phase.as_str()));
        let body = serde_json::to_vec_pretty(output).context("Failed to serialize phase output")?;
        write_atomic(&path, &body).await
    }

    async fn save_files(&self, run_id: RunId, key: &str, files: &[GeneratedFile]) -> Result<()> {
        let dir = self.key_dir(run_id, key)?;
        for file in files {
            let path = dir.join(checked_name(&file.name)?);
            write_atomic(&path, file.content.as_bytes()).await?;
        }
        Ok(())
    }

    async fn load_files(&self, run_id: RunId, key: &str) -> Result<Vec<GeneratedFile>> {
        let dir = self.key_dir(run_id, key)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?
        {
            let path = entry.path();
            if !entry.file_type().await?.is_file()
                || path.extension().is_some_and(|ext| ext == "tmp")
            {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            files.push(GeneratedFile::new(
                entry.file_name().to_string_lossy().into_owned(),
                content,
            ));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_save_and_load_files() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = FsArtifactStore::new(tmp.path());
        let run_id = Uuid::new_v4();

        store
            .save_files(
                run_id,
                SUITE_KEY,
                &[
                    GeneratedFile::new("test_b.py", "def test_b(): pass\n"),
                    GeneratedFile::new("test_a.py", "def test_a(): pass\n"),
                ],
            )
            .await?;
        store
            .save_files(
                run_id,
                SUITE_KEY,
                &[GeneratedFile::new("test_a.py", "def test_a(): assert True\n")],
            )
            .await?;

        let files = store.load_files(run_id, SUITE_KEY).await?;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "test_a.py");
        assert_eq!(files[0].content, "def test_a(): assert True\n");
        assert_eq!(files[1].name, "test_b.py");
        Ok(())
    }

    #[tokio::test]
    async fn test_healing_snapshots_are_separate() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = FsArtifactStore::new(tmp.path());
        let run_id = Uuid::new_v4();
        let file = GeneratedFile::new("test_login.py", "fixed\n");
        store
            .save_files(run_id, &healing_snapshot_key(1), std::slice::from_ref(&file))
            .await?;

        assert!(store.load_files(run_id, SUITE_KEY).await?.is_empty());
        assert_eq!(
            store.load_files(run_id, &healing_snapshot_key(1)).await?,
            vec![file]
        );
        assert!(
            tmp.path()
                .join(run_id.to_string())
                .join("healing/attempt-1/test_login.py")
                .exists()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_phase_output_written_as_json() -> Result<()> {
        let tmp = TempDir::new()?;
        let store = FsArtifactStore::new(tmp.path());
        let run_id = Uuid::new_v4();
        store
            .save_phase_output(run_id, Phase::Discovery, &serde_json::json!({"pagesCount": 2}))
            .await?;
        let path = tmp
            .path()
            .join(run_id.to_string())
            .join("phases/discovery.json");
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(value["pagesCount"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(tmp.path());
        let run_id = Uuid::new_v4();
        for name in ["../escape.py", "..", "", "dir/file.py"] {
            let result = store
                .save_files(run_id, SUITE_KEY, &[GeneratedFile::new(name, "x")])
                .await;
            assert!(result.is_err(), "{:?} should be rejected", name);
        }
        assert!(store.load_files(run_id, "../other").await.is_err());
    }
}
