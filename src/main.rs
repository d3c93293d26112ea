// src/main.rs

use anyhow::{bail, Result};
use chunkrelay::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const FILE_SIZE: usize = 10 * 1024 * 1024 + 123;
const CHUNK_SIZE: u64 = 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chunkrelay=debug")),
        )
        .init();

    let workdir = std::env::temp_dir().join(format!("chunkrelay-demo-{}", std::process::id()));
    tokio::fs::create_dir_all(&workdir).await?;

    let source = workdir.join("payload.bin");
    let payload: Vec<u8> = (0..FILE_SIZE).map(|i| (i * 31 % 251) as u8).collect();
    tokio::fs::write(&source, &payload).await?;

    let config = EngineConfig {
        chunk_size: CHUNK_SIZE,
        chunking_threshold: CHUNK_SIZE,
        temp_dir: workdir.join("cache"),
        database_path: workdir.join("state.db"),
        ..EngineConfig::default()
    };
    let state = StateManager::new(&config.database_path).await?;
    let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(20)));
    let engine = Arc::new(TransferEngine::new(config, transport, state)?);

    let destination = DestinationId::from("demo-channel");
    let credentials: Vec<CredentialId> = vec!["bot-a".into(), "bot-b".into(), "bot-c".into()];

    let mut progress = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            tracing::info!(job_id = %event.job_id, "{}/{} chunks ({:.0}%)", event.completed, event.total, event.percent);
        }
    });

    // Upload, interrupted part way through.
    let mut upload = engine
        .create_upload_job(&source, destination.clone(), credentials.clone())
        .await?;
    let canceller = {
        let engine = engine.clone();
        let job_id = upload.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.cancel(job_id).await
        })
    };
    let first = engine.upload(&mut upload, &source).await?;
    let _ = canceller.await;
    tracing::info!(status = ?first.status, done = first.completed_count(), "first upload attempt finished");

    let upload_outcome = if first.is_success() {
        first
    } else {
        let temp_dir = engine.temp_dir_for(upload.id);
        let done = engine.checkpoint(upload.id).await?.indices();
        engine
            .resume(&mut upload, TransferSource::File(source.clone()), &done, &temp_dir)
            .await?
    };
    if !upload_outcome.is_success() {
        bail!("upload failed: {:?}", upload_outcome.error_summary());
    }
    tracing::info!(marker = %upload_outcome.marker(), "upload complete");

    // Download it back and compare.
    let output = workdir.join("payload.out");
    let mut download = engine
        .create_download_job(
            upload.file_name.clone(),
            upload.total_size,
            destination.clone(),
            credentials.clone(),
            upload.sha256_checksum.clone(),
        )
        .await?;
    let download_outcome = engine.download(&mut download, upload_outcome.chunks.clone(), &output).await?;
    if !download_outcome.is_success() {
        bail!("download failed: {:?}", download_outcome.error_summary());
    }
    if tokio::fs::read(&output).await? != payload {
        bail!("downloaded file differs from the source");
    }
    tracing::info!(output = %output.display(), "download verified");

    let deleted = engine.delete_remote_chunks(&upload, &upload_outcome.chunks).await;
    tracing::info!(deleted, "remote chunks deleted");

    engine.cleanup(&upload).await?;
    engine.cleanup(&download).await?;
    tokio::fs::remove_dir_all(&workdir).await?;
    Ok(())
}
