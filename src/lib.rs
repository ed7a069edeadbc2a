//! devstack - local development stacks on top of Docker Compose
//!
//! devstack keeps a persisted definition of a group of cooperating
//! services and drives them through the container runtime:
//!
//! - Runtime probing (legacy `docker-compose` or integrated `docker compose`)
//! - Dependency-ordered start and reverse-ordered stop
//! - Live status derived from container health
//! - Account provisioning inside running nodes

pub mod config;
pub mod context;
pub mod error;
pub mod runtime;
pub mod stack;

pub use error::{Result, StackError};
