//! Fixtures shared by unit and integration tests.

mod chain;
mod pool;
mod server;
mod source;
mod validator;

pub use pool::{PoolCall, RecordingPool};
pub use server::{MockConnector, MockElectrumServer};
pub use source::ScriptedHeaderSource;
pub use validator::ScriptedValidator;
