//! Lifecycle workflows
//!
//! Each workflow is a sequence of API calls driven by a controller handler. Workflows take a
//! [`GroupContext`](crate::controllers::GroupContext) and re-read the objects they act on,
//! so they are safe to run again after a partial failure.

pub mod backrest;
pub mod cluster;
pub mod manifests;
pub mod policy;
pub mod rmdata;
pub mod task;
pub mod upgrade;
pub mod workflow;
