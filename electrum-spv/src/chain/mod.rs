//! Header chains, checkpoints and the shared chain registry.

pub mod checkpoints;
pub mod header;
pub mod header_chain;
pub mod registry;
pub mod store;
pub mod validator;

pub use checkpoints::{Checkpoint, CheckpointManager, NetworkParams};
pub use header::{Header, HEADER_SIZE};
pub use header_chain::{ChainId, HeaderChain};
pub use registry::{ChainRegistry, Chains};
pub use store::{HeaderStore, StoreWriter};
pub use validator::HeaderValidator;
