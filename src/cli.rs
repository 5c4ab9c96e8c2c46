use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "anka-provision",
    version,
    about = "Build macOS VM templates with the Anka virtualization CLI"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "anka.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print step lines
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create or clone the VM, provision it and park it
    Build {
        /// Delete an existing VM with the target name first
        #[arg(short, long)]
        force: bool,

        /// Skip the [push] post-processor
        #[arg(long)]
        no_push: bool,
    },

    /// Push an existing VM to the registry using the [push] settings
    Push {
        /// VM to push (defaults to vm.name from the config)
        vm: Option<String>,
    },

    /// Print a VM descriptor
    Show {
        vm: String,
    },

    /// Delete a VM
    Delete {
        vm: String,
    },

    /// Load and check the config without touching any VM
    Validate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Interactive on a terminal, plain otherwise
    Auto,
    Interactive,
    Plain,
    /// One JSON object per line
    Json,
}
