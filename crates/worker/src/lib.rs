//! `relay-worker`: consumes job ids, executes jobs exactly-once-ish under a
//! distributed lock, and drives each job through its status machine.
//!
//! All collaborators (repository, lock store, broker, execution backend) are
//! injected; the binary wires the production adapters, tests wire the
//! in-memory ones.

pub mod config;
pub mod consumer;
pub mod duration;
pub mod executor;
pub mod lock;
pub mod polling;
pub mod processor;
pub mod retry;

pub use config::{ConfigError, ConsumerMode, WorkerConfig};
pub use consumer::{Consumer, ConsumerStats};
pub use executor::{
    BackendKind, ExecutionBackend, ExecutionError, ExecutionOutput, ShellBackend, SimulatedBackend,
};
pub use lock::{LockGuard, LockManager};
pub use polling::{PollingConsumer, PollingRequeue};
pub use processor::{JobProcessor, ProcessOutcome, ProcessorConfig, SkipReason};
pub use retry::{BrokerRequeue, Requeue, RetryScheduler};
