//! Transactional apply
//!
//! Replaces a user's live channel list with the locked set:
//!
//! ```text
//! PreFlight ─▶ Snapshot ─▶ Prune ─▶ Add ─▶ Commit ─▶ Done
//!                            │        │       │
//!                            └────────┴───────┴──▶ RollingBack
//! ```
//!
//! Pre-flight checks every channel has a lock before anything is touched.
//! A failure after the snapshot removes every channel the run touched and
//! re-adds the snapshot, then reports the original error.

use std::collections::BTreeMap;
use std::fmt;

use crate::channel::ResolvedChannels;
use crate::error::{ChanlockError, Result};
use crate::gateway::ChannelGateway;
use crate::lock::LockFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    PreFlight,
    Snapshot,
    Prune,
    Add,
    Commit,
    RollingBack,
    Done,
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreFlight => "pre-flight",
            Self::Snapshot => "snapshot",
            Self::Prune => "prune",
            Self::Add => "add",
            Self::Commit => "commit",
            Self::RollingBack => "rolling back",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Remove live channels that are not declared
    pub override_channels: bool,
    /// Commit with a bare `nix-channel --update`
    pub update_all: bool,
}

/// Result of a successful apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// Channels added or re-pointed
    pub added: Vec<String>,
    /// Live channels removed because they were not declared
    pub pruned: Vec<String>,
}

pub struct ApplyEngine<'a> {
    gateway: ChannelGateway<'a>,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(gateway: ChannelGateway<'a>) -> Self {
        Self { gateway }
    }

    pub fn apply(
        &self,
        lock: &LockFile,
        channels: &ResolvedChannels,
        options: ApplyOptions,
    ) -> Result<ApplyResult> {
        let user = self.gateway.identity().clone();
        self.enter(ApplyPhase::PreFlight);

        let mut plan: Vec<(&str, &str)> = Vec::with_capacity(channels.len());
        for (name, input) in channels.iter() {
            let locked = lock.get(input).ok_or_else(|| ChanlockError::MissingLock {
                channel: name.to_string(),
            })?;
            plan.push((name, locked.url.as_str()));
        }

        self.enter(ApplyPhase::Snapshot);
        let snapshot = self.gateway.list()?;

        let mut touched: Vec<String> = Vec::new();
        let mut result = ApplyResult::default();

        match self.mutate(&plan, &snapshot, channels, options, &mut touched, &mut result) {
            Ok(()) => {
                self.enter(ApplyPhase::Done);
                tracing::info!(
                    user = %user,
                    added = result.added.len(),
                    pruned = result.pruned.len(),
                    "applied channels"
                );
                Ok(result)
            }
            Err(err) => {
                self.enter(ApplyPhase::RollingBack);
                tracing::warn!(user = %user, error = %err, "apply failed, restoring channels");
                self.restore(&touched, &snapshot);
                Err(err)
            }
        }
    }

    fn mutate(
        &self,
        plan: &[(&str, &str)],
        snapshot: &BTreeMap<String, String>,
        channels: &ResolvedChannels,
        options: ApplyOptions,
        touched: &mut Vec<String>,
        result: &mut ApplyResult,
    ) -> Result<()> {
        if options.override_channels {
            self.enter(ApplyPhase::Prune);
            for name in snapshot.keys().filter(|n| !channels.contains(n)) {
                touched.push(name.clone());
                self.gateway.remove(name)?;
                result.pruned.push(name.clone());
            }
        }

        self.enter(ApplyPhase::Add);
        for (name, url) in plan {
            touched.push(name.to_string());
            self.gateway.add(name, url)?;
            result.added.push(name.to_string());
        }

        self.enter(ApplyPhase::Commit);
        if options.update_all {
            self.gateway.update_all()
        } else {
            let names: Vec<String> = plan.iter().map(|(name, _)| name.to_string()).collect();
            self.gateway.update(&names)
        }
    }

    /// Best effort: every step is attempted even if an earlier one fails.
    ///
    /// Runs on a fresh cancel flag so an interrupted apply is still undone.
    fn restore(&self, touched: &[String], snapshot: &BTreeMap<String, String>) {
        let exec = self.gateway.executor();
        let ctx = exec.context().uncancelled();
        let gateway = self.gateway.rebind(exec.with_context(&ctx));

        for name in touched {
            if let Err(e) = gateway.remove(name) {
                tracing::warn!(channel = %name, error = %e, "rollback: cannot remove channel");
            }
        }
        for (name, url) in snapshot {
            if let Err(e) = gateway.add(name, url) {
                tracing::warn!(channel = %name, error = %e, "rollback: cannot restore channel");
            }
        }
    }

    fn enter(&self, phase: ApplyPhase) {
        tracing::debug!(user = %self.gateway.identity(), %phase, "apply phase");
    }
}
