//! PostgreSQL Operator
//!
//! Runs PostgreSQL clusters on Kubernetes through the `Pgcluster`, `Pgreplica`, `Pgtask`
//! and `Pgpolicy` custom resources, with Patroni for high availability and pgBackRest
//! for backups.

pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod index;
pub mod kubeapi;
pub mod lifecycle;
pub mod metrics;
pub mod ns;
pub mod operator;

pub use error::{Error, Result};
