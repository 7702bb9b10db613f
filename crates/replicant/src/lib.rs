//! A replicated-log follower: attaches a read-only replica shard to a
//! remote core node, bulk-bootstraps its tables, then streams committed
//! transactions while preserving strict per-shard ordering. See
//! [`actor`] for the state machine this crate exists to implement.

pub mod actor;
pub mod applier;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod model;
pub mod read_router;
pub mod spill;
pub mod status;
pub mod supervisor;
pub mod upstream;
