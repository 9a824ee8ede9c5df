//! Pure domain logic for the job orchestrator.
//!
//! Nothing in this crate performs I/O. Job classes, the status state
//! machine, parameter validation, worker output parsing, command templates
//! and the failure taxonomy all live here so the `db` and `worker` crates
//! share one definition of each.

pub mod command;
pub mod error;
pub mod failure;
pub mod job_class;
pub mod job_status;
pub mod progress;
pub mod types;
