mod client;
mod connection;
mod endpoint;
mod pool;

pub use client::{ClientError, LocalClient, QueryOutcome, ResultSet};
pub use connection::{BackendConnection, BackendError, Reply, ReplyKind, ReplyShape};
pub use endpoint::{ConnectOutcome, Endpoint, EndpointState};
pub use pool::WorkerPool;
