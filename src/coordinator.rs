// src/coordinator.rs

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ChunkCache;
use crate::integrity::short_hash;
use crate::label::{ChunkLabel, ChunkedMarker};
use crate::models::{ChunkDescriptor, ChunkInfo, ChunkState, CredentialId, DestinationId, TransferJob};
use crate::planner::ChunkRange;
use crate::state_manager::ChunkStore;
use crate::transporter::{ChunkError, ChunkTransporter};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("credential pool is empty")]
    NoCredentials,
}

/// Published after every newly completed chunk. `completed` never decreases
/// within one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub completed: u32,
    pub total: u32,
    pub percent: f32,
}

impl ProgressEvent {
    fn new(job_id: Uuid, completed: u32, total: u32) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            completed as f32 * 100.0 / total as f32
        };
        Self {
            job_id,
            completed,
            total,
            percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Result of one coordinator run.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub job_id: Uuid,
    pub status: OutcomeStatus,
    pub total_chunks: u32,
    /// Every completed chunk, resumed ones included, ordered by index.
    pub chunks: Vec<ChunkInfo>,
    pub descriptors: Vec<ChunkDescriptor>,
    pub failures: BTreeMap<u32, ChunkError>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    pub fn completed_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn completed_indices(&self) -> BTreeSet<u32> {
        self.chunks.iter().map(|c| c.index).collect()
    }

    /// True if every remaining failure may clear up by running the job again.
    pub fn is_retryable(&self) -> bool {
        !self.is_success() && self.failures.values().all(ChunkError::is_transient)
    }

    /// Marker for the parent record of an uploaded file.
    pub fn marker(&self) -> ChunkedMarker {
        ChunkedMarker {
            count: self.total_chunks,
            refs: self.chunks.iter().map(|c| c.remote_ref.clone()).collect(),
        }
    }

    pub fn error_summary(&self) -> Option<String> {
        match self.status {
            OutcomeStatus::Completed => None,
            OutcomeStatus::Cancelled => Some(format!(
                "cancelled after {} of {} chunks",
                self.completed_count(),
                self.total_chunks
            )),
            OutcomeStatus::Failed => {
                let reasons: Vec<String> = self.failures.values().map(ToString::to_string).collect();
                Some(format!(
                    "{} of {} chunks failed: {}",
                    self.total_chunks - self.completed_count(),
                    self.total_chunks,
                    reasons.join("; ")
                ))
            }
        }
    }
}

/// The per-chunk network work of one job direction.
#[async_trait]
pub trait ChunkTask: Send + Sync {
    async fn run(
        &self,
        index: u32,
        credential: &CredentialId,
        transporter: &ChunkTransporter,
        cancel: &CancellationToken,
    ) -> Result<ChunkInfo, ChunkError>;

    /// Credential that must be used for `index`, when it is fixed by earlier work.
    fn preferred_credential(&self, _index: u32) -> Option<&CredentialId> {
        None
    }
}

// ---------------------------------------------------------------------------
// Upload / download tasks
// ---------------------------------------------------------------------------

/// Reads chunk ranges from a local file and sends them.
pub struct UploadTask {
    source: PathBuf,
    file_id: Uuid,
    file_name: String,
    total_chunks: u32,
    destination: DestinationId,
    ranges: Vec<ChunkRange>,
}

impl UploadTask {
    pub fn new(job: &TransferJob, source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            file_id: job.id,
            file_name: job.file_name.clone(),
            total_chunks: job.total_chunks,
            destination: job.destination.clone(),
            ranges: job.ranges(),
        }
    }

    async fn read_range(&self, range: &ChunkRange) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.source).await?;
        file.seek(SeekFrom::Start(range.offset)).await?;
        let mut buf = vec![0u8; range.length as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl ChunkTask for UploadTask {
    async fn run(
        &self,
        index: u32,
        credential: &CredentialId,
        transporter: &ChunkTransporter,
        cancel: &CancellationToken,
    ) -> Result<ChunkInfo, ChunkError> {
        let range = self.ranges.get(index as usize).ok_or_else(|| ChunkError::Integrity {
            index,
            reason: "index outside the chunk plan".into(),
        })?;
        let data = self.read_range(range).await.map_err(|e| ChunkError::io(index, e))?;

        let label = ChunkLabel {
            file_id: self.file_id,
            index,
            total: self.total_chunks,
            name: self.file_name.clone(),
            hash: short_hash(&data),
        };
        transporter
            .send_chunk(credential, &self.destination, Bytes::from(data), &label, cancel)
            .await
    }
}

/// Fetches chunks listed in a manifest into a [`ChunkCache`], checking each one.
pub struct DownloadTask {
    destination: DestinationId,
    manifest: BTreeMap<u32, ChunkInfo>,
    cache: ChunkCache,
}

impl DownloadTask {
    pub fn new(destination: DestinationId, manifest: impl IntoIterator<Item = ChunkInfo>, cache: ChunkCache) -> Self {
        Self {
            destination,
            manifest: manifest.into_iter().map(|c| (c.index, c)).collect(),
            cache,
        }
    }
}

#[async_trait]
impl ChunkTask for DownloadTask {
    async fn run(
        &self,
        index: u32,
        credential: &CredentialId,
        transporter: &ChunkTransporter,
        cancel: &CancellationToken,
    ) -> Result<ChunkInfo, ChunkError> {
        let info = self.manifest.get(&index).ok_or_else(|| ChunkError::Integrity {
            index,
            reason: "no remote reference for chunk".into(),
        })?;

        let bytes = transporter
            .fetch_chunk(credential, &self.destination, index, &info.remote_ref, cancel)
            .await?;

        if bytes.len() as u64 != info.size {
            return Err(ChunkError::Integrity {
                index,
                reason: format!("expected {} bytes, got {}", info.size, bytes.len()),
            });
        }
        if !info.hash.is_empty() {
            let actual = short_hash(&bytes);
            if actual != info.hash {
                return Err(ChunkError::Integrity {
                    index,
                    reason: format!("hash {actual} does not match {}", info.hash),
                });
            }
        }

        self.cache
            .write_chunk(index, &bytes)
            .await
            .map_err(|e| ChunkError::io(index, e))?;
        Ok(info.clone())
    }

    fn preferred_credential(&self, index: u32) -> Option<&CredentialId> {
        self.manifest.get(&index).map(|info| &info.credential)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Shared, lock-guarded record of one run.
struct Ledger {
    completed: BTreeMap<u32, ChunkInfo>,
    failed: BTreeMap<u32, ChunkError>,
    descriptors: Vec<ChunkDescriptor>,
}

struct RunContext {
    job_id: Uuid,
    total: u32,
    ledger: Mutex<Ledger>,
    completed_count: AtomicU32,
    store: Arc<dyn ChunkStore>,
    events: broadcast::Sender<ProgressEvent>,
}

impl RunContext {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, index: u32, state: ChunkState) {
        let mut ledger = self.ledger();
        if let Some(d) = ledger.descriptors.get_mut(index as usize) {
            if d.state != ChunkState::Completed {
                d.state = state;
            }
        }
    }

    async fn record_success(&self, info: ChunkInfo) {
        // Persist first: a crash after this point loses nothing for this chunk.
        if let Err(e) = self.store.append_completed_chunk(self.job_id, &info).await {
            tracing::warn!(job_id = %self.job_id, index = info.index, error = %e, "failed to persist completed chunk");
        }

        let mut ledger = self.ledger();
        if ledger.completed.contains_key(&info.index) {
            return;
        }
        if let Some(d) = ledger.descriptors.get_mut(info.index as usize) {
            d.complete(&info);
        }
        ledger.failed.remove(&info.index);
        ledger.completed.insert(info.index, info);
        // Counted and published under the lock so events stay in order.
        let done = self.completed_count.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.events.send(ProgressEvent::new(self.job_id, done, self.total));
    }

    fn record_failure(&self, error: ChunkError) {
        let index = error.index();
        let mut ledger = self.ledger();
        if let Some(d) = ledger.descriptors.get_mut(index as usize) {
            d.state = ChunkState::Failed;
        }
        ledger.failed.insert(index, error);
    }
}

/// Runs all chunks of a job through a bounded pool of parallel tasks.
#[derive(Clone)]
pub struct TransferCoordinator {
    transporter: ChunkTransporter,
    events: broadcast::Sender<ProgressEvent>,
}

impl TransferCoordinator {
    pub fn new(transporter: ChunkTransporter) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { transporter, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn transporter(&self) -> &ChunkTransporter {
        &self.transporter
    }

    /// Transfers every chunk of `job` not already in `resumed`.
    ///
    /// Phase 1 runs all pending chunks. If some failed and at least one
    /// succeeded, phase 2 runs exactly the failed ones once more on the same
    /// credentials. The job succeeds iff every chunk is completed.
    pub async fn run(
        &self,
        job: &TransferJob,
        task: Arc<dyn ChunkTask>,
        resumed: BTreeMap<u32, ChunkInfo>,
        store: Arc<dyn ChunkStore>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome, CoordinatorError> {
        let total = job.total_chunks;
        let resumed: BTreeMap<u32, ChunkInfo> =
            resumed.into_iter().filter(|(index, _)| *index < total).collect();
        let pending: Vec<u32> = (0..total).filter(|i| !resumed.contains_key(i)).collect();

        if !pending.is_empty() && job.credentials.is_empty() {
            return Err(CoordinatorError::NoCredentials);
        }

        let baseline = resumed.len() as u32;
        let descriptors = job.descriptors(&resumed);
        let ctx = Arc::new(RunContext {
            job_id: job.id,
            total,
            ledger: Mutex::new(Ledger {
                completed: resumed,
                failed: BTreeMap::new(),
                descriptors,
            }),
            completed_count: AtomicU32::new(baseline),
            store,
            events: self.events.clone(),
        });
        let _ = self.events.send(ProgressEvent::new(job.id, baseline, total));

        tracing::info!(
            job_id = %job.id,
            total,
            resumed = baseline,
            lanes = job.credentials.len(),
            "starting chunk transfer"
        );

        let phase_one = self.run_phase(job, &ctx, &task, pending, &cancel).await;

        let retry: Vec<u32> = ctx.ledger().failed.keys().copied().collect();
        if !retry.is_empty() && !cancel.is_cancelled() {
            if phase_one > 0 {
                tracing::info!(job_id = %job.id, chunks = ?retry, "retrying failed chunks");
                self.run_phase(job, &ctx, &task, retry, &cancel).await;
            } else {
                // Nothing got through at all; treated as systemic rather than per-chunk.
                tracing::warn!(job_id = %job.id, failed = retry.len(), "no chunk succeeded, skipping retry phase");
            }
        }

        let ledger = match Arc::try_unwrap(ctx) {
            Ok(ctx) => ctx.ledger.into_inner().unwrap_or_else(|e| e.into_inner()),
            Err(ctx) => {
                let ledger = ctx.ledger();
                Ledger {
                    completed: ledger.completed.clone(),
                    failed: ledger.failed.clone(),
                    descriptors: ledger.descriptors.clone(),
                }
            }
        };

        let status = if ledger.completed.len() as u32 == total {
            OutcomeStatus::Completed
        } else if cancel.is_cancelled() {
            OutcomeStatus::Cancelled
        } else {
            OutcomeStatus::Failed
        };

        let outcome = TransferOutcome {
            job_id: job.id,
            status,
            total_chunks: total,
            chunks: ledger.completed.into_values().collect(),
            descriptors: ledger.descriptors,
            failures: ledger.failed,
        };
        match outcome.error_summary() {
            None => tracing::info!(job_id = %job.id, total, "all chunks transferred"),
            Some(summary) => tracing::warn!(job_id = %job.id, %summary, "chunk transfer incomplete"),
        }
        Ok(outcome)
    }

    /// Runs `indices` with at most one task per credential lane in flight.
    /// Returns how many chunks completed in this phase.
    async fn run_phase(
        &self,
        job: &TransferJob,
        ctx: &Arc<RunContext>,
        task: &Arc<dyn ChunkTask>,
        indices: Vec<u32>,
        cancel: &CancellationToken,
    ) -> u32 {
        let lanes = Arc::new(Semaphore::new(job.credentials.len().max(1)));
        let mut set = JoinSet::new();

        for index in &indices {
            let index = *index;
            let credential = match task.preferred_credential(index) {
                Some(owner) if job.credentials.contains(owner) => owner.clone(),
                _ => match job.credential_for(index) {
                    Some(c) => c.clone(),
                    None => continue,
                },
            };
            let lanes = lanes.clone();
            let ctx = ctx.clone();
            let task = task.clone();
            let transporter = self.transporter.clone();
            let cancel = cancel.clone();

            set.spawn(async move {
                let Ok(_permit) = lanes.acquire_owned().await else {
                    return false;
                };
                if cancel.is_cancelled() {
                    ctx.record_failure(ChunkError::Cancelled { index });
                    return false;
                }

                ctx.set_state(index, ChunkState::InFlight);
                match task.run(index, &credential, &transporter, &cancel).await {
                    Ok(info) => {
                        ctx.record_success(info).await;
                        true
                    }
                    Err(error) => {
                        tracing::debug!(index, credential = %credential, error = %error, "chunk failed");
                        ctx.record_failure(error);
                        false
                    }
                }
            });
        }

        let mut succeeded = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(job_id = %job.id, error = %e, "chunk task aborted"),
            }
        }

        // A task that panicked left no record; count it as failed.
        let mut ledger = ctx.ledger();
        for index in indices {
            if !ledger.completed.contains_key(&index) && !ledger.failed.contains_key(&index) {
                ledger.failed.insert(
                    index,
                    ChunkError::Io {
                        index,
                        message: "chunk task aborted".into(),
                    },
                );
            }
        }
        succeeded
    }
}
