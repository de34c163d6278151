//! Per-invocation workflow
//!
//! ```text
//! host.toml ─┐
//!            ├─▶ reconcile ─▶ apply (per user) ─▶ registry ─▶ save lock
//! host.lock.json ─┘
//! ```
//!
//! Nothing is written to disk until every step before it succeeded.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::apply::{ApplyEngine, ApplyResult};
use crate::channel::{ChannelInput, RefLookup};
use crate::config::Config;
use crate::error::{ChanlockError, Result};
use crate::exec::{Executor, Identity};
use crate::gateway::ChannelGateway;
use crate::lock::{write_atomic, LockFile};
use crate::reconcile::{ReconcileMode, Reconciler};
use crate::registry::{self, Registry};
use crate::store::{StorePath, StoreRoot};

/// Where the config, lock and registry of a host live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub config: PathBuf,
    pub lock: PathBuf,
    pub registry: PathBuf,
}

impl StatePaths {
    /// `<stem>.lock.json` and `<stem>.registry.json` next to the config,
    /// unless given explicitly
    pub fn new(config: PathBuf, lock: Option<PathBuf>, registry: Option<PathBuf>) -> Self {
        let stem = config.with_extension("");
        let sibling = |suffix: &str| {
            let mut name = stem.clone().into_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };

        Self {
            lock: lock.unwrap_or_else(|| sibling(".lock.json")),
            registry: registry.unwrap_or_else(|| sibling(".registry.json")),
            config,
        }
    }
}

/// The external tools a run talks to
#[derive(Clone, Copy)]
pub struct Backend<'a> {
    pub exec: Executor<'a>,
    pub lookup: &'a dyn RefLookup,
    pub store_root: &'a StoreRoot,
}

/// Config plus the lock it is pinned by
#[derive(Debug, Clone)]
pub struct State {
    pub config: Config,
    pub lock: LockFile,
}

/// What [`State::update`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockChanges {
    pub changed: Vec<ChannelInput>,
}

impl LockChanges {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

impl State {
    pub fn load(paths: &StatePaths) -> Result<Self> {
        Ok(Self {
            config: Config::load(&paths.config)?,
            lock: LockFile::load(&paths.lock)?,
        })
    }

    /// Reconcile the lock against the config.
    ///
    /// With `only`, just the named channels are reconciled and merged into
    /// the existing lock. Entries for inputs no longer declared are dropped.
    pub fn update(
        &mut self,
        backend: &Backend<'_>,
        mode: ReconcileMode,
        only: &[String],
        allow_hash_update: bool,
    ) -> Result<LockChanges> {
        let targets = self.inputs_for(only)?;

        let reconciled = Reconciler::new(backend.exec, backend.lookup, backend.store_root)
            .allow_hash_update(allow_hash_update)
            .reconcile(&targets, &self.lock, mode)?;

        let mut next = self.lock.clone();
        next.merge(reconciled);
        next.retain_inputs(&self.config.declared_inputs()?);

        let changes = LockChanges {
            changed: next
                .changed_inputs(&self.lock)
                .into_iter()
                .cloned()
                .collect(),
        };
        self.lock = next;
        Ok(changes)
    }

    /// Apply the lock to every configured user
    pub fn apply(&self, backend: &Backend<'_>) -> Result<Vec<(String, ApplyResult)>> {
        let mut results = Vec::with_capacity(self.config.users.len());

        for (username, user) in &self.config.users {
            let channels = self.config.user_channels(username)?;
            let gateway = ChannelGateway::new(backend.exec, user.identity(username));
            tracing::info!(user = %username, channels = channels.len(), "applying channels");

            let result = ApplyEngine::new(gateway)
                .apply(&self.lock, &channels, user.apply_options())
                .map_err(|e| e.for_user(username))?;
            results.push((username.clone(), result));
        }

        Ok(results)
    }

    /// Roll back the channel profile of one user
    pub fn rollback(&self, backend: &Backend<'_>, username: &str) -> Result<()> {
        let identity = match self.config.users.get(username) {
            Some(user) => user.identity(username),
            None => Identity::new(username),
        };
        ChannelGateway::new(backend.exec, identity)
            .rollback()
            .map_err(|e| e.for_user(username))
    }

    /// The flakes registry, if enabled
    pub fn registry(&self, backend: &Backend<'_>) -> Result<Option<Registry>> {
        if !self.config.flakes.enable {
            return Ok(None);
        }
        let root = backend.store_root.get(&backend.exec)?;
        let channels = self.config.flake_channels()?;
        registry::project(&self.lock, &channels, root).map(Some)
    }

    /// Store path of one of `username`'s channels
    pub fn store_path(&self, backend: &Backend<'_>, username: &str, channel: &str) -> Result<StorePath> {
        let channels = self.config.user_channels(username)?;
        let input = channels.get(channel).ok_or_else(|| ChanlockError::UnknownChannel {
            channel: channel.to_string(),
        })?;
        let locked = self.lock.get(input).ok_or_else(|| ChanlockError::MissingLock {
            channel: channel.to_string(),
        })?;
        let root = backend.store_root.get(&backend.exec)?;
        StorePath::locate(root, &locked.store_hash).map_err(|e| e.for_channel(channel))
    }

    /// `-I name=<store path>` for every channel of `username`
    pub fn include_flags(&self, backend: &Backend<'_>, username: &str) -> Result<Vec<String>> {
        let channels = self.config.user_channels(username)?;
        channels
            .names()
            .map(|name| {
                let path = self.store_path(backend, username, name)?;
                Ok(format!("-I {}={}", name, path))
            })
            .collect()
    }

    /// Write the lock, and the registry when given
    pub fn save(&self, paths: &StatePaths, registry: Option<&Registry>) -> Result<()> {
        if let Some(registry) = registry {
            let rendered = registry.render(self.config.flakes.format)?;
            write_atomic(&paths.registry, rendered.as_bytes())?;
            tracing::debug!(path = %paths.registry.display(), "wrote registry");
        }
        self.lock.save(&paths.lock)?;
        tracing::debug!(path = %paths.lock.display(), "wrote lock file");
        Ok(())
    }

    /// Inputs declared for the named channels (all when empty)
    pub fn inputs_for(&self, names: &[String]) -> Result<BTreeSet<ChannelInput>> {
        if names.is_empty() {
            self.config.declared_inputs()
        } else {
            self.config.filter_channels(names).declared_inputs()
        }
    }
}
