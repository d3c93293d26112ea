pub mod bot_api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod integrity;
pub mod label;
pub mod limiter;
pub mod models;
pub mod planner;
pub mod reassembler;
pub mod state_manager;
pub mod transport;
pub mod transporter;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::bot_api::BotApiTransport;
    pub use crate::config::{EngineConfig, RateLimitConfig};
    pub use crate::coordinator::{OutcomeStatus, ProgressEvent, TransferOutcome};
    pub use crate::engine::{EngineError, TransferEngine, TransferSource};
    pub use crate::label::{ChunkLabel, ChunkedMarker};
    pub use crate::limiter::CredentialRateLimiter;
    pub use crate::models::{ChunkInfo, CredentialId, DestinationId, Direction, JobStatus, TransferJob};
    pub use crate::state_manager::{ChunkStore, StateManager};
    pub use crate::transport::{MemoryTransport, Transport, TransportError};
    pub use crate::transporter::RetryPolicy;
}
