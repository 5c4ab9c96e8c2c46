#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod anka;
pub mod artifact;
pub mod builder;
pub mod cli;
pub mod communicator;
pub mod config;
pub mod error;
pub mod flow;
pub mod installer;
pub mod logging;
pub mod observer;
pub mod paths;
pub mod push;
pub mod util;
pub mod vm_state;
