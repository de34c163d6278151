//! Lock file
//!
//! ```json
//! {
//!   "channels": {
//!     "github:NixOS/nixpkgs nixos-23.11": {
//!       "url": "https://github.com/NixOS/nixpkgs/archive/<commit>.tar.gz",
//!       "store_hash": "4ch3bm9bx98jf68ri8jmx00k479mv8g6"
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::channel::ChannelInput;
use crate::error::{ChanlockError, Result};
use crate::store::StoreHash;

/// What a declared input was pinned to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLock {
    /// The resolved URL handed to nix-channel
    pub url: String,
    /// Hash part of the store path the URL was fetched into
    pub store_hash: StoreHash,
}

impl ChannelLock {
    /// Same URL, different content
    pub fn hash_changed(&self, newer: &ChannelLock) -> bool {
        self.url == newer.url && self.store_hash != newer.store_hash
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    #[serde(default)]
    pub channels: BTreeMap<ChannelInput, ChannelLock>,
}

impl LockFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a lock file; a missing file is an empty lock
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map_err(|e| ChanlockError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Write the lock atomically next to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        write_atomic(path, content.as_bytes())
    }

    pub fn get(&self, input: &ChannelInput) -> Option<&ChannelLock> {
        self.channels.get(input)
    }

    pub fn insert(&mut self, input: ChannelInput, lock: ChannelLock) {
        self.channels.insert(input, lock);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Overwrite entries with those of `newer`
    pub fn merge(&mut self, newer: LockFile) {
        self.channels.extend(newer.channels);
    }

    /// Drop entries for inputs that are no longer declared
    pub fn retain_inputs(&mut self, declared: &BTreeSet<ChannelInput>) {
        self.channels.retain(|input, _| declared.contains(input));
    }

    /// Inputs whose lock differs between `self` and `other`, including
    /// inputs present in only one of them
    pub fn changed_inputs<'l>(&'l self, other: &'l LockFile) -> BTreeSet<&'l ChannelInput> {
        self.channels
            .keys()
            .chain(other.channels.keys())
            .filter(|input| self.channels.get(*input) != other.channels.get(*input))
            .collect()
    }
}

/// Replace `path` with `content` through a temp file in the same directory
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ChanlockError::Io(e.error))?;
    Ok(())
}
