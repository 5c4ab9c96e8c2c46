//! Everything that talks to the anka CLI.
//!
//! [`runner`] spawns the tool and splits its output, [`protocol`] parses the
//! machine-readable envelope, and [`VmClient`] turns subcommands into typed
//! calls. Steps only ever see the client.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use client::{CreateParams, VmClient};
pub use registry::{PullParams, PushParams, RegistryParams};
pub use runner::{AnkaCli, EXIT_DISCONNECTED, RunParams, Runner};
