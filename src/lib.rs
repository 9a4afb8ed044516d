//! Hull - container lifecycle manager
//!
//! Hull is the part of a Docker-like container engine daemon that owns
//! container records and drives them through their lifecycle:
//!
//! - create, start, stop, kill, pause, restart, rename, update and remove
//! - exec processes, logs, stats and filesystem archives
//! - in-place image upgrade with rollback, commit and checkpoints
//! - persistence of container records and reconciliation after a restart
//!
//! The low-level runtime, the image store and the volume drivers are
//! collaborators reached through the traits in [`runtime`], [`image`] and
//! [`storage`].

pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod image;
pub mod logging;
pub mod meta;
pub mod runtime;
pub mod spec;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use container::ContainerManager;
pub use error::{HullError, Result};
