//! Electrum server connections: wire protocol, TLS trust, per-server lifecycle and
//! the connection pool.

pub mod bucket;
pub mod connection;
pub mod constants;
pub mod event;
pub mod pool;
pub mod rpc;
pub mod server_addr;
pub mod session;
pub mod timeout;
pub mod tls;
pub mod transport;
pub mod validate;

pub use bucket::{bucket_for, NetworkBucket};
pub use connection::{ConnectionSettings, ConnectionStatus, PoolHandle, ServerConnection, SessionHeaderSource};
pub use event::NetworkEvent;
pub use pool::{BucketPolicy, ConnectionPool};
pub use server_addr::{Protocol, ServerAddr, ServerAddrError};
pub use session::{BoxedStream, NotificationQueue, ServerSession};
pub use timeout::{NetworkTimeout, TimeoutLevel, Timeouts};
pub use tls::TrustRoot;
pub use transport::{Connected, Connector, TcpConnector};
