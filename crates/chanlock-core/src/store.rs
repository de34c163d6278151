//! Nix store path codec
//!
//! Store entries are named `<hash>-<name>` directly under the store root
//! (usually `/nix/store`), where `<hash>` is nixbase32 encoded.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ChanlockError, Result};
use crate::exec::Executor;

pub mod nixbase32 {
    //! The base32 variant used by Nix: no `e`, `o`, `t` or `u`, and the
    //! digits are laid out least significant first.

    pub const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

    fn digit(c: u8) -> Option<u8> {
        ALPHABET.iter().position(|&a| a == c).map(|p| p as u8)
    }

    pub fn encoded_len(len: usize) -> usize {
        (len * 8).div_ceil(5)
    }

    pub fn encode(input: &[u8]) -> String {
        let len = encoded_len(input.len());
        let mut out = String::with_capacity(len);
        for n in (0..len).rev() {
            let b = n * 5;
            let i = b / 8;
            let j = b % 8;
            let low = (input[i] >> j) as u16;
            let high = if i + 1 < input.len() {
                (input[i + 1] as u16) << (8 - j)
            } else {
                0
            };
            out.push(ALPHABET[((low | high) & 0x1f) as usize] as char);
        }
        out
    }

    /// Decode a nixbase32 string, rejecting foreign characters and
    /// non-zero padding bits.
    pub fn decode(input: &str) -> Option<Vec<u8>> {
        let bytes = input.as_bytes();
        let size = bytes.len() * 5 / 8;
        let mut out = vec![0u8; size];

        for n in 0..bytes.len() {
            let d = digit(bytes[bytes.len() - n - 1])? as u16;
            let b = n * 5;
            let i = b / 8;
            let j = b % 8;
            let shifted = d << j;
            if i < size {
                out[i] |= shifted as u8;
            } else if shifted & 0xff != 0 {
                return None;
            }
            let carry = shifted >> 8;
            if i + 1 < size {
                out[i + 1] |= carry as u8;
            } else if carry != 0 {
                return None;
            }
        }

        Some(out)
    }
}

/// The hash part of a store path name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StoreHash(String);

impl StoreHash {
    /// Validate `hash` as nixbase32
    pub fn new(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        if hash.is_empty() || nixbase32::decode(&hash).is_none() {
            return Err(ChanlockError::InvalidStoreHash { hash });
        }
        Ok(Self(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for StoreHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        StoreHash::new(raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for StoreHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decomposed store location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePath {
    pub root: PathBuf,
    pub name: String,
    pub hash: StoreHash,
}

impl StorePath {
    /// Parse `path` inside `root`.
    ///
    /// Only the first segment below `root` counts, so
    /// `/nix/store/<hash>-nixos/nixos` parses as `<hash>-nixos`.
    pub fn parse(root: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let path = path.as_ref();

        let relative = path
            .strip_prefix(root)
            .map_err(|_| ChanlockError::InvalidStoreName {
                name: path.display().to_string(),
            })?;

        let first = relative
            .components()
            .find_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .unwrap_or_default();

        let (hash, name) = match first.split_once('-') {
            Some((hash, name)) if !hash.is_empty() && !name.is_empty() => (hash, name),
            _ => return Err(ChanlockError::InvalidStoreName { name: first }),
        };

        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            hash: StoreHash::new(hash)?,
        })
    }

    /// Find the entry in `root` whose name starts with `<hash>-`
    pub fn locate(root: impl AsRef<Path>, hash: &StoreHash) -> Result<Self> {
        let root = root.as_ref();
        let prefix = format!("{}-", hash);

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Self::parse(root, entry.path());
            }
        }

        Err(ChanlockError::StorePathNotFound {
            root: root.to_path_buf(),
            hash: hash.to_string(),
        })
    }

    pub fn to_path(&self) -> PathBuf {
        self.root.join(format!("{}-{}", self.hash, self.name))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path().display())
    }
}

/// The store directory, discovered once and then memoized
#[derive(Debug, Default)]
pub struct StoreRoot {
    cached: OnceCell<PathBuf>,
}

impl StoreRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store root that never asks Nix
    pub fn fixed(path: impl Into<PathBuf>) -> Self {
        Self {
            cached: OnceCell::with_value(path.into()),
        }
    }

    /// Return the store directory, evaluating `builtins.storeDir` on first use
    pub fn get(&self, exec: &Executor<'_>) -> Result<&Path> {
        self.cached
            .get_or_try_init(|| Self::discover(exec))
            .map(PathBuf::as_path)
    }

    /// Forget the memoized value
    pub fn invalidate(&mut self) {
        self.cached.take();
    }

    fn discover(exec: &Executor<'_>) -> Result<PathBuf> {
        let args = ["--json", "--eval", "-E", "builtins.storeDir"].map(String::from);
        let out = exec.run("nix-instantiate", &args)?;
        let dir: String = serde_json::from_str(out.trim())?;
        tracing::debug!(store_dir = %dir, "discovered store directory");
        Ok(PathBuf::from(dir))
    }
}
