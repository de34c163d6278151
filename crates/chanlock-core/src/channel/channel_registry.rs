//! Declared channel sets
//!
//! A set maps channel names to inputs, plus aliases that reuse another
//! channel's input under a second name:
//!
//! ```toml
//! channels = { nixpkgs = "github:NixOS/nixpkgs nixos-23.11" }
//! aliases = { pkgs = "nixpkgs" }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ChanlockError, Result};

use super::types::ChannelInput;

/// Channels and aliases as written in the config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSet {
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelInput>,

    /// Alias name -> channel (or alias) name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl ChannelSet {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.aliases.is_empty()
    }

    /// Add or replace a channel
    pub fn insert(&mut self, name: impl Into<String>, input: ChannelInput) {
        self.channels.insert(name.into(), input);
    }

    /// Add or replace an alias
    pub fn alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    pub fn get(&self, name: &str) -> Option<&ChannelInput> {
        self.channels.get(name)
    }

    /// Channel and alias names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.channels
            .keys()
            .chain(self.aliases.keys())
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Keep the named channels and aliases, plus every channel a kept alias
    /// leads to
    pub fn filter(&self, names: &[String]) -> Self {
        let mut keep: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let mut pending: Vec<&str> = keep.iter().copied().collect();
        while let Some(name) = pending.pop() {
            if let Some(target) = self.aliases.get(name) {
                if keep.insert(target) {
                    pending.push(target);
                }
            }
        }

        Self {
            channels: self
                .channels
                .iter()
                .filter(|(name, _)| keep.contains(name.as_str()))
                .map(|(name, input)| (name.clone(), input.clone()))
                .collect(),
            aliases: self
                .aliases
                .iter()
                .filter(|(name, _)| keep.contains(name.as_str()))
                .map(|(name, target)| (name.clone(), target.clone()))
                .collect(),
        }
    }

    /// Expand aliases into concrete channels.
    ///
    /// Aliases may point at other aliases; chains are followed until a
    /// channel is reached.
    pub fn resolve_aliases(&self) -> Result<ResolvedChannels> {
        let mut resolved: BTreeMap<String, ChannelInput> = self.channels.clone();

        for alias in self.aliases.keys() {
            if self.channels.contains_key(alias) {
                return Err(ChanlockError::InvalidInput {
                    input: alias.clone(),
                    reason: "alias has the same name as a channel".to_string(),
                });
            }
            let input = self.follow(alias)?;
            resolved.insert(alias.clone(), input.clone());
        }

        Ok(ResolvedChannels(resolved))
    }

    fn follow(&self, alias: &str) -> Result<&ChannelInput> {
        let mut seen = BTreeSet::new();
        let mut target = alias;

        while let Some(next) = self.aliases.get(target) {
            if !seen.insert(target) {
                return Err(ChanlockError::AliasCycle {
                    alias: alias.to_string(),
                });
            }
            target = next;
        }

        self.channels
            .get(target)
            .ok_or_else(|| ChanlockError::UnknownAlias {
                alias: alias.to_string(),
                target: target.to_string(),
            })
    }
}

/// Channel name -> input with every alias expanded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedChannels(BTreeMap<String, ChannelInput>);

impl ResolvedChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, input: ChannelInput) {
        self.0.insert(name.into(), input);
    }

    pub fn get(&self, name: &str) -> Option<&ChannelInput> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelInput)> {
        self.0.iter().map(|(name, input)| (name.as_str(), input))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Distinct inputs; aliases share their target's input
    pub fn inputs(&self) -> BTreeSet<&ChannelInput> {
        self.0.values().collect()
    }

    /// Keep only the named channels
    pub fn filter(&self, names: &[String]) -> Self {
        self.0
            .iter()
            .filter(|(name, _)| names.contains(*name))
            .map(|(name, input)| (name.clone(), input.clone()))
            .collect()
    }

    /// Overlay `other` on top of `self`, replacing entries of the same name
    pub fn shadowed_by(mut self, other: ResolvedChannels) -> Self {
        self.0.extend(other.0);
        self
    }
}

impl FromIterator<(String, ChannelInput)> for ResolvedChannels {
    fn from_iter<I: IntoIterator<Item = (String, ChannelInput)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ResolvedChannels {
    type Item = (String, ChannelInput);
    type IntoIter = std::collections::btree_map::IntoIter<String, ChannelInput>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
