pub mod connection_pool;
pub mod metrics;
pub mod pipeline;
pub mod protocols;
pub mod route_table;
pub mod splitter;

// Re-export core types
pub use connection_pool::{
    BackendConnection, ConnectionPool, ConnectionPoolBuilder, Connector, PoolError, TcpConnector,
    UnitPool,
};
pub use metrics::{PoolStats, PoolStatsSnapshot};
pub use pipeline::{Pipeline, PipelineError, TaskError, TaskState};
pub use protocols::{CommandFrame, ProtocolError};
pub use route_table::{BucketRouter, BucketTable, RouteError, RouteTableBuilder};
pub use splitter::{split, SubCommand};
