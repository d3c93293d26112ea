// src/cache.rs

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const ARTIFACT_PREFIX: &str = "chunk_";
const ARTIFACT_EXT: &str = "part";

/// On-disk store of downloaded chunks for one job.
///
/// An artifact only appears under its final name once it is fully written, so
/// every `chunk_<index>.part` found here is a complete chunk. Nothing in the
/// engine deletes the directory except [`ChunkCache::remove`].
#[derive(Debug, Clone)]
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<root>/<job_id>`
    pub fn for_job(root: &Path, job_id: Uuid) -> Self {
        Self::new(root.join(job_id.to_string()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{ARTIFACT_PREFIX}{index:06}.{ARTIFACT_EXT}"))
    }

    pub async fn write_chunk(&self, index: u32, bytes: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let final_path = self.artifact_path(index);
        let temp_path = final_path.with_extension("tmp");
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;
        Ok(final_path)
    }

    pub async fn read_chunk(&self, index: u32) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.artifact_path(index)).await
    }

    /// Indices of the complete artifacts present. A missing directory is empty.
    pub async fn list_indices(&self) -> io::Result<BTreeSet<u32>> {
        list_temp_chunk_artifacts(&self.dir).await
    }

    /// Paths of the artifacts present, keyed by index.
    pub async fn artifacts(&self) -> io::Result<BTreeMap<u32, PathBuf>> {
        Ok(self
            .list_indices()
            .await?
            .into_iter()
            .map(|index| (index, self.artifact_path(index)))
            .collect())
    }

    /// Deletes the job's cache directory.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn parse_artifact_name(name: &str) -> Option<u32> {
    name.strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Scans `dir` for chunk artifacts and returns their indices.
pub async fn list_temp_chunk_artifacts(dir: &Path) -> io::Result<BTreeSet<u32>> {
    let mut indices = BTreeSet::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(indices),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(index) = entry.file_name().to_str().and_then(parse_artifact_name) {
            indices.insert(index);
        }
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn written_chunks_are_listed() {
        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::for_job(dir.path(), Uuid::new_v4());

        cache.write_chunk(2, b"cc").await.unwrap();
        cache.write_chunk(0, b"aa").await.unwrap();
        assert_eq!(cache.list_indices().await.unwrap(), BTreeSet::from([0, 2]));
        assert_eq!(cache.read_chunk(2).await.unwrap(), b"cc");
    }

    #[tokio::test]
    async fn unfinished_and_foreign_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::new(dir.path().join("job"));
        cache.write_chunk(1, b"done").await.unwrap();
        std::fs::write(cache.dir().join("chunk_000003.tmp"), b"half").unwrap();
        std::fs::write(cache.dir().join("notes.txt"), b"x").unwrap();
        std::fs::write(cache.dir().join("chunk_abc.part"), b"x").unwrap();

        assert_eq!(cache.list_indices().await.unwrap(), BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let indices = list_temp_chunk_artifacts(&dir.path().join("nope")).await.unwrap();
        assert!(indices.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::new(dir.path().join("job"));
        cache.write_chunk(0, b"x").await.unwrap();
        cache.remove().await.unwrap();
        assert!(!cache.dir().exists());
        cache.remove().await.unwrap();
    }
}
