// src/reassembler.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::planner::ChunkRange;

#[derive(Debug, Error)]
pub enum ReassemblyError {
    #[error("missing chunks: {0:?}")]
    MissingChunks(Vec<u32>),
    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    WrongLength { index: u32, expected: u64, actual: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Path the output is written to before it is moved into place.
pub fn temporary_path(output: &Path) -> PathBuf {
    PathBuf::from(format!("{}.part", output.to_string_lossy()))
}

/// Concatenates chunk files `0..total_chunks` into `output`, in index order.
///
/// Fails without creating `output` if any index is missing. Returns the number
/// of bytes written.
pub async fn assemble(
    chunks: &BTreeMap<u32, PathBuf>,
    total_chunks: u32,
    output: &Path,
) -> Result<u64, ReassemblyError> {
    check_complete(chunks, total_chunks)?;
    write_output(chunks, total_chunks, output).await
}

/// Like [`assemble`], but also checks every chunk file against its planned length.
pub async fn assemble_verified(
    chunks: &BTreeMap<u32, PathBuf>,
    ranges: &[ChunkRange],
    output: &Path,
) -> Result<u64, ReassemblyError> {
    let total_chunks = ranges.len() as u32;
    check_complete(chunks, total_chunks)?;
    for range in ranges {
        let actual = tokio::fs::metadata(&chunks[&range.index]).await?.len();
        if actual != range.length {
            return Err(ReassemblyError::WrongLength {
                index: range.index,
                expected: range.length,
                actual,
            });
        }
    }
    write_output(chunks, total_chunks, output).await
}

fn check_complete(chunks: &BTreeMap<u32, PathBuf>, total_chunks: u32) -> Result<(), ReassemblyError> {
    let missing: Vec<u32> = (0..total_chunks).filter(|i| !chunks.contains_key(i)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ReassemblyError::MissingChunks(missing))
    }
}

async fn write_output(
    chunks: &BTreeMap<u32, PathBuf>,
    total_chunks: u32,
    output: &Path,
) -> Result<u64, ReassemblyError> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = temporary_path(output);
    let result = append_all(chunks, total_chunks, &temp_path).await;
    match result {
        Ok(written) => {
            tokio::fs::rename(&temp_path, output).await?;
            tracing::debug!(output = %output.display(), bytes = written, chunks = total_chunks, "file reassembled");
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(e)
        }
    }
}

async fn append_all(
    chunks: &BTreeMap<u32, PathBuf>,
    total_chunks: u32,
    temp_path: &Path,
) -> Result<u64, ReassemblyError> {
    let mut writer = BufWriter::new(File::create(temp_path).await?);
    let mut written = 0;
    for index in 0..total_chunks {
        let mut chunk = File::open(&chunks[&index]).await?;
        written += tokio::io::copy(&mut chunk, &mut writer).await?;
    }
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner;
    use tempfile::TempDir;

    fn write_parts(dir: &Path, parts: &[(u32, &[u8])]) -> BTreeMap<u32, PathBuf> {
        parts
            .iter()
            .map(|(index, data)| {
                let path = dir.join(format!("p{index}"));
                std::fs::write(&path, data).unwrap();
                (*index, path)
            })
            .collect()
    }

    #[tokio::test]
    async fn concatenates_in_index_order() {
        let dir = TempDir::new().unwrap();
        // Inserted out of order on purpose.
        let chunks = write_parts(dir.path(), &[(2, b"EE"), (0, b"AABB"), (1, b"CCDD")]);
        let output = dir.path().join("out/file.bin");

        let written = assemble(&chunks, 3, &output).await.unwrap();
        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&output).unwrap(), b"AABBCCDDEE");
        assert!(!temporary_path(&output).exists());
    }

    #[tokio::test]
    async fn missing_chunk_produces_no_output() {
        let dir = TempDir::new().unwrap();
        let chunks = write_parts(dir.path(), &[(0, b"AABB"), (2, b"EE")]);
        let output = dir.path().join("file.bin");

        let err = assemble(&chunks, 3, &output).await.unwrap_err();
        assert!(matches!(err, ReassemblyError::MissingChunks(ref m) if m == &vec![1]));
        assert!(!output.exists());
        assert!(!temporary_path(&output).exists());
        // Chunk files are left alone.
        assert!(chunks[&0].exists());
    }

    #[tokio::test]
    async fn verified_rejects_short_chunk() {
        let dir = TempDir::new().unwrap();
        let chunks = write_parts(dir.path(), &[(0, b"AABB"), (1, b"CC"), (2, b"EE")]);
        let output = dir.path().join("file.bin");
        let ranges = planner::plan(10, 4).ranges;

        let err = assemble_verified(&chunks, &ranges, &output).await.unwrap_err();
        assert!(matches!(
            err,
            ReassemblyError::WrongLength { index: 1, expected: 4, actual: 2 }
        ));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn vanished_chunk_file_cleans_up_temp_output() {
        let dir = TempDir::new().unwrap();
        let mut chunks = write_parts(dir.path(), &[(0, b"AABB")]);
        chunks.insert(1, dir.path().join("does-not-exist"));
        let output = dir.path().join("file.bin");

        assert!(matches!(
            assemble(&chunks, 2, &output).await,
            Err(ReassemblyError::Io(_))
        ));
        assert!(!output.exists());
        assert!(!temporary_path(&output).exists());
    }
}
