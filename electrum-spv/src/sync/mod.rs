//! Header synchronization against a single server.

pub mod chunks;
pub mod engine;
pub mod source;

pub use chunks::{Chunk, ChunkFetcher};
pub use engine::{SearchStep, StepStatus, SyncEngine};
pub use source::HeaderSource;
