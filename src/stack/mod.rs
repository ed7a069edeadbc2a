//! Stack lifecycle management
//!
//! A stack is a named group of cooperating services persisted under
//! `<stacks_dir>/<name>/stack.json`. This module provides:
//!
//! - The stack data model and its validation
//! - The definition store (atomic writes)
//! - The lifecycle controller (create, start, stop, status)
//! - Account provisioning inside a running node
//!
//! Operations against the same stack are not coordinated with each other.
//! Atomic writes keep `stack.json` intact, but two concurrent `start` calls
//! for one stack race on container creation; callers must serialize
//! lifecycle operations per stack. Different stacks are independent.

pub mod accounts;
pub mod controller;
pub mod definition;
pub mod store;
pub mod topology;

pub use accounts::AccountProvisioner;
pub use controller::{LifecycleController, StackState};
pub use definition::{AccountIdentity, HealthcheckSpec, ServiceSpec, StackDefinition, Topology};
pub use store::StackStore;
