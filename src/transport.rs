// src/transport.rs

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::label::ChunkLabel;
use crate::models::{CredentialId, DestinationId};

/// Failure reported by a transport, already classified.
///
/// The engine decides retries from the variant alone and never looks at the
/// message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("throttled by server (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Client { .. })
    }

    /// Wait suggested by the server, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Maps an HTTP-like status code to a classification.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        match status {
            429 => TransportError::Throttled { retry_after },
            500..=599 => TransportError::Server {
                status,
                message: message.into(),
            },
            _ => TransportError::Client {
                status,
                message: message.into(),
            },
        }
    }
}

/// A message created on the remote side by a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: i64,
    pub remote_ref: String,
}

/// The message-oriented API the engine moves chunks through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_chunk(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        bytes: Bytes,
        label: &ChunkLabel,
    ) -> Result<RemoteMessage, TransportError>;

    /// Turns a remote reference into something `fetch_bytes` can download.
    async fn resolve_download_location(
        &self,
        credential: &CredentialId,
        remote_ref: &str,
    ) -> Result<String, TransportError>;

    async fn fetch_bytes(&self, credential: &CredentialId, location: &str) -> Result<Bytes, TransportError>;

    async fn delete_remote_message(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        message_id: i64,
    ) -> Result<bool, TransportError>;
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Send,
    Resolve,
    Fetch,
    Delete,
}

/// One call seen by a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub op: Operation,
    pub credential: CredentialId,
    pub chunk: Option<u32>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    owner: CredentialId,
    destination: DestinationId,
    label: ChunkLabel,
    bytes: Bytes,
}

struct FailureRule {
    op: Operation,
    chunk: Option<u32>,
    error: TransportError,
    remaining: usize,
}

#[derive(Default)]
struct MemoryState {
    messages: HashMap<String, StoredMessage>,
    rules: Vec<FailureRule>,
    calls: Vec<CallRecord>,
}

/// In-process transport keeping messages in a map.
///
/// Used as a loopback for the demo binary and as a scriptable fake in tests.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    next_id: AtomicI64,
    latency: Option<Duration>,
    strict_ownership: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Rejects fetch/delete by any credential other than the one that sent the message.
    pub fn with_strict_ownership(mut self) -> Self {
        self.strict_ownership = true;
        self
    }

    /// Makes the next `times` calls of `op` (for `chunk`, or any chunk) fail with `error`.
    pub fn fail(&self, op: Operation, chunk: Option<u32>, error: TransportError, times: usize) {
        self.lock().rules.push(FailureRule {
            op,
            chunk,
            error,
            remaining: times,
        });
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, op: Operation, chunk: u32) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.chunk == Some(chunk))
            .count()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Label of the stored message behind `remote_ref`.
    pub fn label_of(&self, remote_ref: &str) -> Option<ChunkLabel> {
        self.lock().messages.get(remote_ref).map(|m| m.label.clone())
    }

    /// Replaces the stored bytes of a message, to simulate corruption.
    pub fn corrupt(&self, remote_ref: &str, bytes: Bytes) {
        if let Some(message) = self.lock().messages.get_mut(remote_ref) {
            message.bytes = bytes;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, op: Operation, credential: &CredentialId, chunk: Option<u32>) -> Result<(), TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        state.calls.push(CallRecord {
            op,
            credential: credential.clone(),
            chunk,
        });
        let rule = state.rules.iter_mut().find(|r| {
            r.remaining > 0 && r.op == op && (r.chunk.is_none() || r.chunk == chunk)
        });
        match rule {
            Some(rule) => {
                rule.remaining -= 1;
                Err(rule.error.clone())
            }
            None => Ok(()),
        }
    }

    fn chunk_of(&self, remote_ref: &str) -> Option<u32> {
        self.lock().messages.get(remote_ref).map(|m| m.label.index)
    }

    fn check_owner(&self, message: &StoredMessage, credential: &CredentialId) -> Result<(), TransportError> {
        if self.strict_ownership && &message.owner != credential {
            return Err(TransportError::Client {
                status: 400,
                message: "wrong file identifier".into(),
            });
        }
        Ok(())
    }
}

const MEMORY_SCHEME: &str = "mem://";

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_chunk(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        bytes: Bytes,
        label: &ChunkLabel,
    ) -> Result<RemoteMessage, TransportError> {
        self.enter(Operation::Send, credential, Some(label.index)).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let remote_ref = format!("{}-{}-{}", label.file_id.simple(), label.index, id);
        self.lock().messages.insert(
            remote_ref.clone(),
            StoredMessage {
                id,
                owner: credential.clone(),
                destination: destination.clone(),
                label: label.clone(),
                bytes,
            },
        );
        Ok(RemoteMessage { id, remote_ref })
    }

    async fn resolve_download_location(
        &self,
        credential: &CredentialId,
        remote_ref: &str,
    ) -> Result<String, TransportError> {
        self.enter(Operation::Resolve, credential, self.chunk_of(remote_ref)).await?;
        let state = self.lock();
        let message = state.messages.get(remote_ref).ok_or_else(|| TransportError::Client {
            status: 404,
            message: format!("unknown reference {remote_ref}"),
        })?;
        self.check_owner(message, credential)?;
        Ok(format!("{MEMORY_SCHEME}{remote_ref}"))
    }

    async fn fetch_bytes(&self, credential: &CredentialId, location: &str) -> Result<Bytes, TransportError> {
        let remote_ref = location.strip_prefix(MEMORY_SCHEME).unwrap_or(location);
        self.enter(Operation::Fetch, credential, self.chunk_of(remote_ref)).await?;
        let state = self.lock();
        let message = state.messages.get(remote_ref).ok_or_else(|| TransportError::Client {
            status: 404,
            message: format!("unknown location {location}"),
        })?;
        self.check_owner(message, credential)?;
        Ok(message.bytes.clone())
    }

    async fn delete_remote_message(
        &self,
        credential: &CredentialId,
        destination: &DestinationId,
        message_id: i64,
    ) -> Result<bool, TransportError> {
        let key = {
            let state = self.lock();
            state
                .messages
                .iter()
                .find(|(_, m)| m.id == message_id && &m.destination == destination)
                .map(|(k, m)| (k.clone(), m.clone()))
        };
        self.enter(Operation::Delete, credential, key.as_ref().map(|(_, m)| m.label.index))
            .await?;
        let Some((remote_ref, message)) = key else {
            return Ok(false);
        };
        self.check_owner(&message, credential)?;
        Ok(self.lock().messages.remove(&remote_ref).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn label(index: u32) -> ChunkLabel {
        ChunkLabel {
            file_id: Uuid::new_v4(),
            index,
            total: 4,
            name: "a.bin".into(),
            hash: "0000000000000000".into(),
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            TransportError::from_status(429, "slow down", Some(Duration::from_secs(3))),
            TransportError::Throttled {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(TransportError::from_status(502, "bad gateway", None).is_transient());
        assert!(!TransportError::from_status(404, "not found", None).is_transient());
        assert!(!TransportError::from_status(400, "bad request", None).is_transient());
        assert!(TransportError::Network("reset".into()).is_transient());
    }

    #[tokio::test]
    async fn send_fetch_delete_roundtrip() {
        let transport = MemoryTransport::new();
        let cred: CredentialId = "bot-a".into();
        let dest: DestinationId = "chat".into();

        let msg = transport
            .send_chunk(&cred, &dest, Bytes::from_static(b"payload"), &label(1))
            .await
            .unwrap();
        let location = transport.resolve_download_location(&cred, &msg.remote_ref).await.unwrap();
        let bytes = transport.fetch_bytes(&cred, &location).await.unwrap();
        assert_eq!(&bytes[..], b"payload");

        assert!(transport.delete_remote_message(&cred, &dest, msg.id).await.unwrap());
        assert!(!transport.delete_remote_message(&cred, &dest, msg.id).await.unwrap());
        assert_eq!(transport.message_count(), 0);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let transport = MemoryTransport::new();
        transport.fail(Operation::Send, Some(2), TransportError::Network("down".into()), 1);
        let cred: CredentialId = "bot-a".into();
        let dest: DestinationId = "chat".into();

        assert!(transport.send_chunk(&cred, &dest, Bytes::new(), &label(1)).await.is_ok());
        assert!(transport.send_chunk(&cred, &dest, Bytes::new(), &label(2)).await.is_err());
        assert!(transport.send_chunk(&cred, &dest, Bytes::new(), &label(2)).await.is_ok());
        assert_eq!(transport.calls_for(Operation::Send, 2), 2);
    }

    #[tokio::test]
    async fn strict_ownership_rejects_other_credential() {
        let transport = MemoryTransport::new().with_strict_ownership();
        let dest: DestinationId = "chat".into();
        let msg = transport
            .send_chunk(&"bot-a".into(), &dest, Bytes::new(), &label(0))
            .await
            .unwrap();

        let err = transport
            .resolve_download_location(&"bot-b".into(), &msg.remote_ref)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
