use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "chanlock")]
#[command(about = "Declarative, locked Nix channel manager")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ./<hostname>.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Lock file (default: <config stem>.lock.json)
    #[arg(long, global = true)]
    pub lock_file: Option<PathBuf>,

    /// Flakes registry file (default: <config stem>.registry.json)
    #[arg(long, global = true)]
    pub registry_file: Option<PathBuf>,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Resolve every channel again and move branches to their latest commit
    #[arg(short, long, conflicts_with = "update_locks")]
    pub update: bool,

    /// Keep locked URLs but measure their hashes again
    #[arg(long)]
    pub update_locks: bool,

    /// Accept a new hash for a URL that did not change
    #[arg(long)]
    pub allow_hash_update: bool,

    /// Only process these channels
    #[arg(value_name = "CHANNELS")]
    pub channels: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print `-I name=<store path>` flags for a user's locked channels
    IncludeFlags {
        /// User to print flags for (default: current user)
        #[arg(long)]
        user: Option<String>,
    },

    /// Print the store path of a locked channel
    StorePath {
        /// Channel name
        channel: String,

        /// User whose channel set is used (default: current user)
        #[arg(long)]
        user: Option<String>,
    },

    /// Roll a user's channels back one generation
    Rollback {
        /// User to roll back (default: current user)
        #[arg(long)]
        user: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
