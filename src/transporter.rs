// src/transporter.rs

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::label::ChunkLabel;
use crate::limiter::CredentialRateLimiter;
use crate::models::{ChunkInfo, CredentialId, DestinationId};
use crate::transport::{Transport, TransportError};

/// Why a single chunk could not be transferred.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk {index}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        index: u32,
        attempts: u32,
        last: TransportError,
    },
    #[error("chunk {index}: {error}")]
    Permanent { index: u32, error: TransportError },
    #[error("chunk {index}: integrity check failed: {reason}")]
    Integrity { index: u32, reason: String },
    #[error("chunk {index}: io error: {message}")]
    Io { index: u32, message: String },
    #[error("chunk {index}: cancelled")]
    Cancelled { index: u32 },
}

impl ChunkError {
    pub fn index(&self) -> u32 {
        match self {
            ChunkError::Exhausted { index, .. }
            | ChunkError::Permanent { index, .. }
            | ChunkError::Integrity { index, .. }
            | ChunkError::Io { index, .. }
            | ChunkError::Cancelled { index } => *index,
        }
    }

    /// True when running the job again later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChunkError::Exhausted { .. } | ChunkError::Integrity { .. } | ChunkError::Cancelled { .. }
        )
    }

    pub fn io(index: u32, err: std::io::Error) -> Self {
        ChunkError::Io {
            index,
            message: err.to_string(),
        }
    }
}

/// Attempt budget and exponential backoff for one chunk operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Sleep before 1-based `attempt`: nothing before the first, then
    /// `base * 2^(attempt - 2)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 2_u32.saturating_pow(attempt - 2);
        self.base_delay().saturating_mul(multiplier)
    }
}

/// Runs one chunk's network operation behind the rate limiter, with retries.
#[derive(Clone)]
pub struct ChunkTransporter {
    transport: Arc<dyn Transport>,
    limiter: CredentialRateLimiter,
    policy: RetryPolicy,
}

impl ChunkTransporter {
    pub fn new(transport: Arc<dyn Transport>, limiter: CredentialRateLimiter, policy: RetryPolicy) -> Self {
        Self {
            transport,
            limiter,
            policy,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn limiter(&self) -> &CredentialRateLimiter {
        &self.limiter
    }

    /// Sends one chunk; the label travels with it.
    pub async fn send_chunk(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        bytes: Bytes,
        label: &ChunkLabel,
        cancel: &CancellationToken,
    ) -> Result<ChunkInfo, ChunkError> {
        let size = bytes.len() as u64;
        let transport = self.transport.as_ref();
        let message = self
            .with_retry(label.index, credential, destination, cancel, move || {
                transport.send_chunk(credential, destination, bytes.clone(), label)
            })
            .await?;

        tracing::debug!(
            index = label.index,
            credential = %credential,
            message_id = message.id,
            "chunk sent"
        );
        Ok(ChunkInfo {
            index: label.index,
            message_id: message.id,
            remote_ref: message.remote_ref,
            credential: credential.clone(),
            hash: label.hash.clone(),
            size,
        })
    }

    /// Downloads one chunk's bytes.
    pub async fn fetch_chunk(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        index: u32,
        remote_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ChunkError> {
        let transport = self.transport.as_ref();
        self.with_retry(index, credential, destination, cancel, move || async move {
            let location = transport.resolve_download_location(credential, remote_ref).await?;
            transport.fetch_bytes(credential, &location).await
        })
        .await
    }

    /// Deletes the remote message behind a completed chunk, using its owning credential.
    pub async fn delete_chunk(
        &self,
        destination: &DestinationId,
        info: &ChunkInfo,
        cancel: &CancellationToken,
    ) -> Result<bool, ChunkError> {
        let transport = self.transport.as_ref();
        let credential = &info.credential;
        let message_id = info.message_id;
        self.with_retry(info.index, credential, destination, cancel, move || {
            transport.delete_remote_message(credential, destination, message_id)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        index: u32,
        credential: &CredentialId,
        destination: &DestinationId,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ChunkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut hint: Option<Duration> = None;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let backoff = self.policy.delay_before(attempt);
                let delay = hint.take().map_or(backoff, |h| h.max(backoff));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ChunkError::Cancelled { index }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChunkError::Cancelled { index }),
                _ = self.limiter.acquire(credential, destination) => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChunkError::Cancelled { index }),
                result = op() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => {
                    tracing::warn!(
                        index,
                        attempt,
                        max_attempts,
                        credential = %credential,
                        error = %error,
                        "transient chunk failure"
                    );
                    hint = error.retry_after();
                    last_error = Some(error);
                }
                Err(error) => {
                    tracing::warn!(index, credential = %credential, error = %error, "permanent chunk failure");
                    return Err(ChunkError::Permanent { index, error });
                }
            }
        }

        Err(ChunkError::Exhausted {
            index,
            attempts: max_attempts,
            last: last_error.unwrap_or_else(|| TransportError::Network("no attempt made".into())),
        })
    }
}
