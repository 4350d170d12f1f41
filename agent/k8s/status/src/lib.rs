//! Per-node policy status write-back.
//!
//! Every imported `KnetNetworkPolicy` gets a named, long-lived task that
//! waits for local endpoints to converge on the import revision, then
//! publishes this node's enforcement state into the policy's status map.
//! Tasks are keyed so that policy updates replace the task body in place
//! and deletes cancel it.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod sync;
mod tasks;

pub use self::sync::{ApiPolicyStatusClient, PolicyStatusClient, StatusSync};
pub use self::tasks::StatusTasks;
