pub mod array;
pub mod buffer;
pub mod connection;
pub mod resource;

pub use array::{BucketArrayPool, BucketStats};
pub use buffer::{buffer_factory, shared_array_pool, PooledBuffer, SharedArrayPool};
pub use connection::{Connection, ConnectionPool, PooledConnection, TcpConnection};
pub use resource::{Checkout, CleanupReport, PoolEntryId, PoolOptions, PoolStats, Poolable, ResourcePool};
