use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::apply::ApplyOptions;
use crate::channel::{ChannelInput, ChannelSet, ResolvedChannels};
use crate::error::{ChanlockError, Result};
use crate::exec::Identity;
use crate::registry::RegistryFormat;

/// Host configuration
///
/// ```toml
/// [global]
/// channels = { nixpkgs = "github:NixOS/nixpkgs nixos-23.11" }
///
/// [users.root]
/// use-sudo = true
/// override-channels = true
/// channels = { nixos = "https://nixos.org/channels/nixos-23.11/nixexprs.tar.xz" }
///
/// [flakes]
/// enable = true
/// channels = { home-manager = "github:nix-community/home-manager release-23.11" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Channels every user gets
    #[serde(default)]
    pub global: ChannelSet,

    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,

    #[serde(default)]
    pub flakes: FlakesConfig,
}

/// Per-user settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UserConfig {
    /// Run as this user through `sudo -u` when it is not the current user
    #[serde(default)]
    pub use_sudo: bool,

    /// Remove live channels that are not declared
    #[serde(default)]
    pub override_channels: bool,

    /// Commit with a bare `nix-channel --update`
    #[serde(default)]
    pub update_all: bool,

    #[serde(default)]
    pub channels: BTreeMap<String, ChannelInput>,

    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl UserConfig {
    pub fn channel_set(&self) -> ChannelSet {
        ChannelSet {
            channels: self.channels.clone(),
            aliases: self.aliases.clone(),
        }
    }

    fn set_channels(&mut self, set: ChannelSet) {
        self.channels = set.channels;
        self.aliases = set.aliases;
    }

    pub fn identity(&self, username: &str) -> Identity {
        Identity::new(username).with_sudo(self.use_sudo)
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            override_channels: self.override_channels,
            update_all: self.update_all,
        }
    }
}

/// Channels projected into the flakes registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FlakesConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default)]
    pub format: RegistryFormat,

    #[serde(default)]
    pub channels: BTreeMap<String, ChannelInput>,

    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl FlakesConfig {
    pub fn channel_set(&self) -> ChannelSet {
        ChannelSet {
            channels: self.channels.clone(),
            aliases: self.aliases.clone(),
        }
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content).map_err(|e| match e {
            ChanlockError::ConfigParse { message, .. } => ChanlockError::ConfigParse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), users = config.users.len(), "loaded config");
        Ok(config)
    }

    /// Parse and validate config text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| ChanlockError::ConfigParse {
            path: Default::default(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Every alias must resolve
    pub fn validate(&self) -> Result<()> {
        self.global.resolve_aliases()?;
        self.flake_channels()?;
        for (username, user) in &self.users {
            user.channel_set()
                .resolve_aliases()
                .map_err(|e| e.for_user(username))?;
        }
        Ok(())
    }

    pub fn user(&self, username: &str) -> Result<&UserConfig> {
        self.users.get(username).ok_or_else(|| ChanlockError::UnknownUser {
            username: username.to_string(),
        })
    }

    /// Global channels combined with the user's own; the user's win on
    /// name clashes
    pub fn user_channels(&self, username: &str) -> Result<ResolvedChannels> {
        let user = self.user(username)?;
        let global = self.global.resolve_aliases()?;
        let own = user
            .channel_set()
            .resolve_aliases()
            .map_err(|e| e.for_user(username))?;
        Ok(global.shadowed_by(own))
    }

    pub fn flake_channels(&self) -> Result<ResolvedChannels> {
        self.flakes.channel_set().resolve_aliases()
    }

    /// Every input mentioned anywhere, once
    pub fn declared_inputs(&self) -> Result<BTreeSet<ChannelInput>> {
        let mut inputs: BTreeSet<ChannelInput> = BTreeSet::new();
        let mut collect = |channels: ResolvedChannels| {
            inputs.extend(channels.into_iter().map(|(_, input)| input));
        };

        collect(self.global.resolve_aliases()?);
        collect(self.flake_channels()?);
        for username in self.users.keys() {
            collect(self.user_channels(username)?);
        }
        Ok(inputs)
    }

    /// Restrict every section to the named channels.
    ///
    /// A kept alias keeps the channel it points to.
    pub fn filter_channels(&self, names: &[String]) -> Config {
        Config {
            global: self.global.filter(names),
            users: self
                .users
                .iter()
                .map(|(username, user)| {
                    let mut user = user.clone();
                    user.set_channels(user.channel_set().filter(names));
                    (username.clone(), user)
                })
                .collect(),
            flakes: {
                let set = self.flakes.channel_set().filter(names);
                FlakesConfig {
                    channels: set.channels,
                    aliases: set.aliases,
                    ..self.flakes.clone()
                }
            },
        }
    }

    /// Number of channel declarations across all sections
    pub fn channel_count(&self) -> usize {
        self.global.names().len()
            + self.flakes.channel_set().names().len()
            + self
                .users
                .values()
                .map(|u| u.channel_set().names().len())
                .sum::<usize>()
    }
}
