//! Channel declarations and URL resolution
//!
//! # Concepts
//!
//! - **Input**: a source URL plus an optional version (`github:NixOS/nixpkgs nixos-23.11`)
//! - **Channel**: a name bound to an input in the config
//! - **Alias**: a second name for an existing channel
//!
//! # Resolution
//!
//! ```text
//! github:NixOS/nixpkgs nixos-23.11
//!   │  git ls-remote https://github.com/NixOS/nixpkgs nixos-23.11
//!   ▼
//! https://github.com/NixOS/nixpkgs/archive/<commit>.tar.gz
//! ```

mod channel_registry;
mod git;
mod resolve;
mod types;

pub use channel_registry::{ChannelSet, ResolvedChannels};
pub use git::{looks_like_commit, parse_ls_remote, select_ref, version_cmp, GitRefLookup, RefLookup, RemoteRef};
pub use resolve::{Forge, GitRemote, Resolver};
pub use types::{ChannelInput, ChannelUrl, Scheme};
