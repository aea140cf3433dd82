//! ModelServe Dispatcher
//!
//! Routes generation requests across engine replicas in round-robin order and
//! tracks replica health.

pub mod replica;
pub mod router;

pub use replica::{LocalReplica, Replica};
pub use router::{HealthStatus, ReplicaHealth, RequestDispatcher};
