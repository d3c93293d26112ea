// src/engine.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ChunkCache;
use crate::config::{ConfigError, EngineConfig, RateLimitConfig};
use crate::coordinator::{
    ChunkTask, CoordinatorError, DownloadTask, OutcomeStatus, ProgressEvent, TransferCoordinator,
    TransferOutcome, UploadTask,
};
use crate::integrity::{sha256_sum, IntegrityError};
use crate::limiter::CredentialRateLimiter;
use crate::models::{
    ChunkInfo, CredentialId, DestinationId, Direction, JobStatus, ResumeCheckpoint, TransferJob,
};
use crate::planner;
use crate::reassembler::{self, ReassemblyError};
use crate::state_manager::{ChunkStore, StateError, StateManager};
use crate::transport::Transport;
use crate::transporter::ChunkTransporter;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("reassembly failed: {0}")]
    Reassembly(#[from] ReassemblyError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("cannot transfer an empty file")]
    EmptyFile,
    #[error("job with ID {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("job {job_id} is a {expected:?} job")]
    WrongDirection { job_id: Uuid, expected: Direction },
}

/// What a job moves: a local file up, or a set of remote chunks down.
#[derive(Debug, Clone)]
pub enum TransferSource {
    File(PathBuf),
    Remote {
        manifest: Vec<ChunkInfo>,
        output: PathBuf,
    },
}

impl TransferSource {
    fn direction(&self) -> Direction {
        match self {
            TransferSource::File(_) => Direction::Upload,
            TransferSource::Remote { .. } => Direction::Download,
        }
    }
}

/// Ties the coordinator, persistence and chunk cache together and owns job lifecycle.
pub struct TransferEngine {
    config: EngineConfig,
    coordinator: TransferCoordinator,
    state: StateManager,
    cancellation_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    next_offset: AtomicUsize,
}

impl TransferEngine {
    /// With the default quota the engine shares the process-wide limiter registry.
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>, state: StateManager) -> Result<Self, EngineError> {
        let limiter = if config.rate_limit == RateLimitConfig::default() {
            CredentialRateLimiter::global().clone()
        } else {
            CredentialRateLimiter::from_config(&config.rate_limit)
        };
        Self::with_limiter(config, transport, state, limiter)
    }

    pub fn with_limiter(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        state: StateManager,
        limiter: CredentialRateLimiter,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let transporter = ChunkTransporter::new(transport, limiter, config.retry.clone());
        Ok(Self {
            config,
            coordinator: TransferCoordinator::new(transporter),
            state,
            cancellation_tokens: Mutex::new(HashMap::new()),
            next_offset: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.coordinator.subscribe()
    }

    pub fn needs_chunking(&self, size: u64) -> bool {
        planner::needs_chunking(size, self.config.chunking_threshold)
    }

    /// Chunk cache directory used by default for a job.
    pub fn temp_dir_for(&self, job_id: Uuid) -> PathBuf {
        ChunkCache::for_job(&self.config.temp_dir, job_id).dir().to_path_buf()
    }

    /// Plans and records an upload of `source`.
    pub async fn create_upload_job(
        &self,
        source: &Path,
        destination: DestinationId,
        credentials: Vec<CredentialId>,
    ) -> Result<TransferJob, EngineError> {
        let size = tokio::fs::metadata(source).await?.len();
        if size == 0 {
            return Err(EngineError::EmptyFile);
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let mut job = TransferJob::new(
            Direction::Upload,
            file_name,
            size,
            self.config.chunk_size,
            destination,
            credentials,
            self.next_offset.fetch_add(1, Ordering::SeqCst),
        );
        job.sha256_checksum = Some(sha256_sum(source).await?);
        self.state.save_job(&job).await?;

        tracing::info!(
            job_id = %job.id,
            file = %job.file_name,
            size,
            chunks = job.total_chunks,
            chunked = self.needs_chunking(size),
            "upload job created"
        );
        Ok(job)
    }

    /// Records a download of a previously uploaded file.
    pub async fn create_download_job(
        &self,
        file_name: String,
        total_size: u64,
        destination: DestinationId,
        credentials: Vec<CredentialId>,
        sha256_checksum: Option<String>,
    ) -> Result<TransferJob, EngineError> {
        let mut job = TransferJob::new(
            Direction::Download,
            file_name,
            total_size,
            self.config.chunk_size,
            destination,
            credentials,
            self.next_offset.fetch_add(1, Ordering::SeqCst),
        );
        job.sha256_checksum = sha256_checksum;
        self.state.save_job(&job).await?;
        tracing::info!(job_id = %job.id, file = %job.file_name, chunks = job.total_chunks, "download job created");
        Ok(job)
    }

    pub async fn upload(&self, job: &mut TransferJob, source: &Path) -> Result<TransferOutcome, EngineError> {
        let cache = ChunkCache::for_job(&self.config.temp_dir, job.id);
        self.execute(job, TransferSource::File(source.to_path_buf()), cache, BTreeMap::new())
            .await
    }

    /// Fetches every chunk in `manifest` and reassembles them into `output`.
    pub async fn download(
        &self,
        job: &mut TransferJob,
        manifest: Vec<ChunkInfo>,
        output: &Path,
    ) -> Result<TransferOutcome, EngineError> {
        let cache = ChunkCache::for_job(&self.config.temp_dir, job.id);
        let source = TransferSource::Remote {
            manifest,
            output: output.to_path_buf(),
        };
        self.execute(job, source, cache, BTreeMap::new()).await
    }

    /// Chunks recorded as completed for a job by earlier runs.
    pub async fn checkpoint(&self, job_id: Uuid) -> Result<ResumeCheckpoint, EngineError> {
        Ok(ResumeCheckpoint::from_chunks(self.state.load_completed_chunks(job_id).await?))
    }

    pub async fn load_job(&self, job_id: Uuid) -> Result<Option<TransferJob>, EngineError> {
        Ok(self.state.load_job(job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<TransferJob>, EngineError> {
        Ok(self.state.load_all_jobs().await?)
    }

    /// Continues a job, skipping chunks that are already done.
    ///
    /// The skip set is `caller_completed` plus every artifact found in
    /// `temp_dir`. An index is only skipped when its remote record is known
    /// (and, for downloads, its artifact is present); anything else is
    /// transferred again.
    pub async fn resume(
        &self,
        job: &mut TransferJob,
        source: TransferSource,
        caller_completed: &BTreeSet<u32>,
        temp_dir: &Path,
    ) -> Result<TransferOutcome, EngineError> {
        let artifacts = self.state.list_temp_chunk_artifacts(temp_dir).await?;
        let skip: BTreeSet<u32> = caller_completed.union(&artifacts).copied().collect();

        let mut known: BTreeMap<u32, ChunkInfo> = self
            .state
            .load_completed_chunks(job.id)
            .await?
            .into_iter()
            .map(|c| (c.index, c))
            .collect();
        if let TransferSource::Remote { manifest, .. } = &source {
            for info in manifest {
                known.entry(info.index).or_insert_with(|| info.clone());
            }
        }

        let needs_artifact = source.direction() == Direction::Download;
        let mut seeded = BTreeMap::new();
        for index in skip {
            if needs_artifact && !artifacts.contains(&index) {
                tracing::warn!(job_id = %job.id, index, "no cached artifact for completed chunk, fetching again");
                continue;
            }
            match known.remove(&index) {
                Some(info) => {
                    seeded.insert(index, info);
                }
                None => {
                    tracing::warn!(job_id = %job.id, index, "no record for completed chunk, transferring again");
                }
            }
        }

        tracing::info!(job_id = %job.id, skipped = seeded.len(), total = job.total_chunks, "resuming job");
        self.execute(job, source, ChunkCache::new(temp_dir), seeded).await
    }

    /// Cancels a running job. Completed chunks and cached artifacts are kept.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        match self.cancellation_tokens.lock().await.get(&job_id) {
            Some(token) => {
                tracing::info!(%job_id, "cancel requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, job_id: Uuid) -> bool {
        self.cancellation_tokens.lock().await.contains_key(&job_id)
    }

    /// Removes a job's temporary storage and its persisted records.
    pub async fn cleanup(&self, job: &TransferJob) -> Result<(), EngineError> {
        ChunkCache::for_job(&self.config.temp_dir, job.id).remove().await?;
        self.state.delete_job(job.id).await?;
        tracing::info!(job_id = %job.id, "job cleaned up");
        Ok(())
    }

    /// Deletes the remote messages behind `chunks`, each through its owning credential.
    /// Returns how many were deleted.
    pub async fn delete_remote_chunks(&self, job: &TransferJob, chunks: &[ChunkInfo]) -> usize {
        let cancel = CancellationToken::new();
        let transporter = self.coordinator.transporter();
        let mut deleted = 0;
        for info in chunks {
            match transporter.delete_chunk(&job.destination, info, &cancel).await {
                Ok(true) => deleted += 1,
                Ok(false) => {
                    tracing::debug!(job_id = %job.id, index = info.index, "remote chunk already gone");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, index = info.index, error = %e, "failed to delete remote chunk");
                }
            }
        }
        deleted
    }

    async fn execute(
        &self,
        job: &mut TransferJob,
        source: TransferSource,
        cache: ChunkCache,
        seeded: BTreeMap<u32, ChunkInfo>,
    ) -> Result<TransferOutcome, EngineError> {
        if source.direction() != job.direction {
            return Err(EngineError::WrongDirection {
                job_id: job.id,
                expected: job.direction,
            });
        }

        let cancel = {
            let mut tokens = self.cancellation_tokens.lock().await;
            if tokens.contains_key(&job.id) {
                return Err(EngineError::AlreadyRunning(job.id));
            }
            let token = CancellationToken::new();
            tokens.insert(job.id, token.clone());
            token
        };

        let result = self.transfer(job, &source, cache, seeded, cancel).await;

        self.cancellation_tokens.lock().await.remove(&job.id);
        self.coordinator.transporter().limiter().purge_idle();

        let status = match &result {
            Ok(outcome) => match outcome.status {
                OutcomeStatus::Completed => JobStatus::Completed,
                OutcomeStatus::Cancelled => JobStatus::Cancelled,
                OutcomeStatus::Failed => JobStatus::Failed(outcome.error_summary()),
            },
            Err(e) => JobStatus::Failed(Some(e.to_string())),
        };
        job.status = status;
        if let Err(e) = self.state.save_job(job).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to save final job state");
        }
        result
    }

    async fn transfer(
        &self,
        job: &mut TransferJob,
        source: &TransferSource,
        cache: ChunkCache,
        seeded: BTreeMap<u32, ChunkInfo>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, EngineError> {
        job.status = JobStatus::Transferring;
        self.state.save_job(job).await?;

        let task: Arc<dyn ChunkTask> = match source {
            TransferSource::File(path) => Arc::new(UploadTask::new(job, path.clone())),
            TransferSource::Remote { manifest, .. } => Arc::new(DownloadTask::new(
                job.destination.clone(),
                manifest.iter().cloned(),
                cache.clone(),
            )),
        };
        let store: Arc<dyn ChunkStore> = Arc::new(self.state.clone());

        let outcome = self.coordinator.run(job, task, seeded, store, cancel).await?;

        if let (TransferSource::Remote { output, .. }, true) = (source, outcome.is_success()) {
            self.reassemble(job, &cache, output).await?;
        }
        Ok(outcome)
    }

    /// Builds the output file from the cache. The cache is left in place either way.
    async fn reassemble(&self, job: &TransferJob, cache: &ChunkCache, output: &Path) -> Result<(), EngineError> {
        let artifacts = cache.artifacts().await?;
        reassembler::assemble_verified(&artifacts, &job.ranges(), output).await?;

        if let Some(expected) = &job.sha256_checksum {
            let actual = sha256_sum(output).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(output).await;
                return Err(EngineError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        tracing::info!(job_id = %job.id, output = %output.display(), "download reassembled");
        Ok(())
    }
}
