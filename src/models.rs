// src/models.rs

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::planner::{self, ChunkRange};

/// Name of one authorized sender in the credential pool.
///
/// The engine only ever sees this identifier; secrets stay inside the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialId(pub String);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CredentialId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where chunks are sent to (a chat, channel, bucket...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId(pub String);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// The status of a transfer job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Transferring,
    Completed,
    /// Stopped by the caller. Not an error, the job can be resumed.
    Cancelled,
    Failed(Option<String>),
}

/// The state of a single chunk inside a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// Record of a chunk that has been transferred successfully.
///
/// `credential` is the sender that created the remote message; every later
/// operation on that message (fetch, delete) has to go through it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u32,
    pub message_id: i64,
    pub remote_ref: String,
    pub credential: CredentialId,
    /// First 16 hex chars of the chunk's SHA-256.
    pub hash: String,
    pub size: u64,
}

/// Per-chunk bookkeeping, derived from the plan and the completed map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub hash: Option<String>,
    pub remote_ref: Option<String>,
    pub credential: Option<CredentialId>,
    pub state: ChunkState,
}

impl ChunkDescriptor {
    pub fn pending(range: ChunkRange) -> Self {
        Self {
            index: range.index,
            offset: range.offset,
            length: range.length,
            hash: None,
            remote_ref: None,
            credential: None,
            state: ChunkState::Pending,
        }
    }

    /// Marks the chunk completed. A completed chunk never changes again.
    pub fn complete(&mut self, info: &ChunkInfo) {
        if self.state == ChunkState::Completed {
            return;
        }
        self.hash = Some(info.hash.clone());
        self.remote_ref = Some(info.remote_ref.clone());
        self.credential = Some(info.credential.clone());
        self.state = ChunkState::Completed;
    }
}

/// Represents the persistent state of a single transfer job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: Uuid,
    pub direction: Direction,
    /// Original file name, carried in every chunk label.
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub destination: DestinationId,
    /// Ordered credential pool. Index `i` is lane `i`.
    pub credentials: Vec<CredentialId>,
    /// Fixed for the whole resume lineage of the job.
    pub rotation_offset: usize,
    pub status: JobStatus,
    /// Optional full-file SHA-256 checked after reassembly.
    pub sha256_checksum: Option<String>,
}

impl TransferJob {
    pub fn new(
        direction: Direction,
        file_name: String,
        total_size: u64,
        chunk_size: u64,
        destination: DestinationId,
        credentials: Vec<CredentialId>,
        rotation_offset: usize,
    ) -> Self {
        let chunk_size = planner::effective_chunk_size(chunk_size);
        Self {
            id: Uuid::new_v4(),
            direction,
            file_name,
            total_size,
            chunk_size,
            total_chunks: planner::total_chunks(total_size, chunk_size),
            destination,
            credentials,
            rotation_offset,
            status: JobStatus::Queued,
            sha256_checksum: None,
        }
    }

    /// Round-robin lane for a chunk: `pool[(index + offset) mod |pool|]`.
    pub fn credential_for(&self, index: u32) -> Option<&CredentialId> {
        if self.credentials.is_empty() {
            return None;
        }
        let lane = (index as usize + self.rotation_offset) % self.credentials.len();
        self.credentials.get(lane)
    }

    pub fn ranges(&self) -> Vec<ChunkRange> {
        planner::plan(self.total_size, self.chunk_size).ranges
    }

    /// Descriptors for every chunk, with completed ones filled in from `completed`.
    pub fn descriptors(&self, completed: &BTreeMap<u32, ChunkInfo>) -> Vec<ChunkDescriptor> {
        self.ranges()
            .into_iter()
            .map(|range| {
                let mut descriptor = ChunkDescriptor::pending(range);
                if let Some(info) = completed.get(&range.index) {
                    descriptor.complete(info);
                }
                descriptor
            })
            .collect()
    }
}

/// Chunks already completed by earlier runs of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeCheckpoint {
    pub completed: BTreeMap<u32, ChunkInfo>,
}

impl ResumeCheckpoint {
    pub fn from_chunks(chunks: impl IntoIterator<Item = ChunkInfo>) -> Self {
        Self {
            completed: chunks.into_iter().map(|c| (c.index, c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.completed.contains_key(&index)
    }

    pub fn indices(&self) -> BTreeSet<u32> {
        self.completed.keys().copied().collect()
    }
}
