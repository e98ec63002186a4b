//! Job message broker abstraction (mechanics only).
//!
//! Messages carry nothing but a job id encoded as a decimal string. The broker
//! is assumed to deliver **at least once**; consumers rely on the distributed
//! lock and the "status must be pending" guard for idempotency.

pub mod bus;
pub mod in_memory;

pub use bus::{Broker, BrokerError, Delivery};
pub use in_memory::InMemoryBroker;
