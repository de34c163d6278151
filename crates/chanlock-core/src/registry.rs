//! Flakes registry projection
//!
//! Locked flake channels are exposed to `nix` through a registry file that
//! maps each channel name to its fetched source in the store.
//!
//! # Formats
//!
//! ```text
//! flat:  { "<name>": { "type": "path", "path": "<dir>" } }
//! list:  { "flakes": [ { "from": { "type": "indirect", "id": "<name>" },
//!                        "to":   { "type": "path", "path": "<dir>" } } ],
//!          "version": 2 }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::ResolvedChannels;
use crate::error::{ChanlockError, Result};
use crate::lock::LockFile;
use crate::store::StorePath;

/// File that marks a fetched source as a flake
pub const FLAKE_MARKER: &str = "flake.nix";

const REGISTRY_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryFormat {
    Flat,
    #[default]
    List,
}

/// One side of a registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FlakeRef {
    Indirect { id: String },
    Path { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakeEntry {
    pub from: FlakeRef,
    pub to: FlakeRef,
}

#[derive(Debug, Serialize)]
struct ListDocument {
    flakes: Vec<FlakeEntry>,
    version: u32,
}

/// Channel name -> flake directory in the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    pub entries: BTreeMap<String, PathBuf>,
}

impl Registry {
    pub fn entries(&self) -> Vec<FlakeEntry> {
        self.entries
            .iter()
            .map(|(name, path)| FlakeEntry {
                from: FlakeRef::Indirect { id: name.clone() },
                to: FlakeRef::Path { path: path.clone() },
            })
            .collect()
    }

    pub fn to_json(&self, format: RegistryFormat) -> Result<serde_json::Value> {
        let value = match format {
            RegistryFormat::Flat => {
                let flat: BTreeMap<&str, FlakeRef> = self
                    .entries
                    .iter()
                    .map(|(name, path)| (name.as_str(), FlakeRef::Path { path: path.clone() }))
                    .collect();
                serde_json::to_value(flat)?
            }
            RegistryFormat::List => serde_json::to_value(ListDocument {
                flakes: self.entries(),
                version: REGISTRY_VERSION,
            })?,
        };
        Ok(value)
    }

    /// Pretty JSON with a trailing newline
    pub fn render(&self, format: RegistryFormat) -> Result<String> {
        let mut out = serde_json::to_string_pretty(&self.to_json(format)?)?;
        out.push('\n');
        Ok(out)
    }
}

/// Locate the flake source of every channel.
///
/// The fetched tarball unpacks into `<store path>/<store name>/`, which is
/// where the marker has to be.
pub fn project(lock: &LockFile, channels: &ResolvedChannels, store_root: &Path) -> Result<Registry> {
    let mut registry = Registry::default();

    for (name, input) in channels.iter() {
        let locked = lock.get(input).ok_or_else(|| ChanlockError::MissingLock {
            channel: name.to_string(),
        })?;

        let store_path = StorePath::locate(store_root, &locked.store_hash)
            .map_err(|e| e.for_channel(name))?;
        let dir = store_path.to_path().join(&store_path.name);
        let marker = dir.join(FLAKE_MARKER);
        if !marker.is_file() {
            return Err(ChanlockError::MissingFlakeMarker {
                channel: name.to_string(),
                path: marker,
            });
        }

        tracing::debug!(channel = name, path = %dir.display(), "projected flake");
        registry.entries.insert(name.to_string(), dir);
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::lock::ChannelLock;
    use crate::store::StoreHash;

    const HASH: &str = "4ch3bm9bx98jf68ri8jmx00k479mv8g6";

    fn setup(with_marker: bool) -> (TempDir, LockFile, ResolvedChannels) {
        let store = TempDir::new().unwrap();
        let source = store.path().join(format!("{HASH}-source")).join("source");
        fs::create_dir_all(&source).unwrap();
        if with_marker {
            fs::write(source.join(FLAKE_MARKER), "{ }").unwrap();
        }

        let url = "github:nix-community/home-manager release-23.11";
        let mut channels = ResolvedChannels::new();
        channels.insert("home-manager", url.parse().unwrap());

        let mut lock = LockFile::new();
        lock.insert(
            url.parse().unwrap(),
            ChannelLock {
                url: "https://github.com/nix-community/home-manager/archive/abc1234.tar.gz".to_string(),
                store_hash: StoreHash::new(HASH).unwrap(),
            },
        );
        (store, lock, channels)
    }

    #[test]
    fn test_project_finds_flake_dir() {
        let (store, lock, channels) = setup(true);
        let registry = project(&lock, &channels, store.path()).unwrap();
        assert_eq!(
            registry.entries["home-manager"],
            store.path().join(format!("{HASH}-source")).join("source")
        );
    }

    #[test]
    fn test_project_without_lock() {
        let (store, _, channels) = setup(true);
        let err = project(&LockFile::new(), &channels, store.path()).unwrap_err();
        assert!(matches!(err, ChanlockError::MissingLock { channel } if channel == "home-manager"));
    }

    #[test]
    fn test_project_without_marker() {
        let (store, lock, channels) = setup(false);
        let err = project(&lock, &channels, store.path()).unwrap_err();
        match err {
            ChanlockError::MissingFlakeMarker { channel, path } => {
                assert_eq!(channel, "home-manager");
                assert!(path.ends_with("source/flake.nix"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_project_without_store_path() {
        let (_, lock, channels) = setup(true);
        let empty = TempDir::new().unwrap();
        let err = project(&lock, &channels, empty.path()).unwrap_err();
        assert!(matches!(err.root(), ChanlockError::StorePathNotFound { .. }));
    }

    #[test]
    fn test_render_formats() {
        let mut registry = Registry::default();
        registry
            .entries
            .insert("nixpkgs".to_string(), PathBuf::from("/nix/store/x-source/source"));

        assert_eq!(
            registry.to_json(RegistryFormat::Flat).unwrap(),
            json!({ "nixpkgs": { "type": "path", "path": "/nix/store/x-source/source" } })
        );
        assert_eq!(
            registry.to_json(RegistryFormat::List).unwrap(),
            json!({
                "flakes": [{
                    "from": { "type": "indirect", "id": "nixpkgs" },
                    "to": { "type": "path", "path": "/nix/store/x-source/source" }
                }],
                "version": 2
            })
        );
        assert!(registry.render(RegistryFormat::List).unwrap().ends_with("}\n"));
    }

    #[test]
    fn test_format_names() {
        let format: RegistryFormat = serde_json::from_str("\"flat\"").unwrap();
        assert_eq!(format, RegistryFormat::Flat);
        assert_eq!(RegistryFormat::default(), RegistryFormat::List);
    }
}
