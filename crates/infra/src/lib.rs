//! Infrastructure layer: job repository, lock store and broker adapters.
//!
//! Every boundary has an in-memory implementation for tests/dev and a
//! production one (Postgres via sqlx, Redis for locks and streams; the Redis
//! adapters sit behind the `redis` feature).

pub mod broker;
pub mod lock_store;
pub mod repository;

pub use lock_store::{InMemoryLockStore, LockStore, LockStoreError};
pub use repository::{InMemoryJobRepository, JobRepository, PostgresJobRepository, RepositoryError};

#[cfg(feature = "redis")]
pub use broker::RedisStreamsBroker;
#[cfg(feature = "redis")]
pub use lock_store::RedisLockStore;
