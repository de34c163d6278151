//! Lock reconciliation
//!
//! Inputs are pinned by actually fetching them through a temporary
//! `nix-channel` namespace and reading back the store path:
//!
//! ```text
//! resolve URLs (parallel)
//!   → remove leftover chanlock-tmp-* entries
//!   → nix-channel --add <url> chanlock-tmp-<hash>-<name>   (per input)
//!   → nix-channel --update chanlock-tmp-…                  (one batch)
//!   → readlink ~/.nix-defexpr/channels/chanlock-tmp-…      (per input)
//!   → store hash
//! ```
//!
//! The temporary entries of a run stay in place until the next run removes
//! them, so a failed run can still be inspected.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::channel::{ChannelInput, RefLookup};
use crate::error::{ChanlockError, Result};
use crate::exec::{Executor, Identity};
use crate::gateway::ChannelGateway;
use crate::lock::{ChannelLock, LockFile};
use crate::store::{StorePath, StoreRoot};

/// Which inputs get re-resolved and re-measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Only inputs without a lock are resolved and measured
    MissingOnly,
    /// Locked URLs are kept but every hash is measured again
    LocksOnly,
    /// Every input is resolved again (branches move to their latest commit)
    FullUpdate,
}

pub struct Reconciler<'a> {
    exec: Executor<'a>,
    lookup: &'a dyn RefLookup,
    store_root: &'a StoreRoot,
    identity: Identity,
    allow_hash_update: bool,
}

impl<'a> Reconciler<'a> {
    /// Reconciler measuring hashes as the current user
    pub fn new(exec: Executor<'a>, lookup: &'a dyn RefLookup, store_root: &'a StoreRoot) -> Self {
        Self {
            identity: exec.context().current_identity(),
            exec,
            lookup,
            store_root,
            allow_hash_update: false,
        }
    }

    /// Accept a different hash for an unchanged URL
    pub fn allow_hash_update(mut self, allow: bool) -> Self {
        self.allow_hash_update = allow;
        self
    }

    /// Produce a lock covering exactly `declared`
    pub fn reconcile(
        &self,
        declared: &BTreeSet<ChannelInput>,
        existing: &LockFile,
        mode: ReconcileMode,
    ) -> Result<LockFile> {
        let mut result = LockFile::new();
        let mut to_resolve = Vec::new();
        let mut urls: BTreeMap<ChannelInput, String> = BTreeMap::new();

        for input in declared {
            match (mode, existing.get(input)) {
                (ReconcileMode::MissingOnly, Some(lock)) => {
                    result.insert(input.clone(), lock.clone());
                }
                (ReconcileMode::LocksOnly, Some(lock)) => {
                    urls.insert(input.clone(), lock.url.clone());
                }
                _ => to_resolve.push(input),
            }
        }

        tracing::info!(
            ?mode,
            declared = declared.len(),
            resolve = to_resolve.len(),
            "reconciling locks"
        );

        urls.extend(self.resolve_all(&to_resolve)?);
        if urls.is_empty() {
            return Ok(result);
        }

        for (input, lock) in self.measure(&urls)? {
            if let Some(old) = existing.get(&input) {
                if old.hash_changed(&lock) {
                    if !self.allow_hash_update {
                        return Err(ChanlockError::HashChanged {
                            input: input.to_string(),
                            old: old.store_hash.to_string(),
                            new: lock.store_hash.to_string(),
                        });
                    }
                    tracing::warn!(
                        input = %input,
                        old = %old.store_hash,
                        new = %lock.store_hash,
                        "accepting changed store hash"
                    );
                }
            }
            result.insert(input, lock);
        }

        Ok(result)
    }

    fn resolve_all(&self, inputs: &[&ChannelInput]) -> Result<Vec<(ChannelInput, String)>> {
        let lookup = self.lookup;
        inputs
            .par_iter()
            .map(|input| {
                let url = input.resolve(lookup)?;
                tracing::debug!(input = %input, url = %url, "resolved");
                Ok(((*input).clone(), url))
            })
            .collect()
    }

    /// Fetch every URL in the temporary namespace and read back its hash
    fn measure(&self, urls: &BTreeMap<ChannelInput, String>) -> Result<Vec<(ChannelInput, ChannelLock)>> {
        let temp = ChannelGateway::temporary(self.exec, self.identity.clone());

        let stale = temp.remove_all()?;
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "removed stale temporary channels");
        }

        let mut names: BTreeMap<&ChannelInput, String> = BTreeMap::new();
        let mut batch: BTreeSet<String> = BTreeSet::new();
        for (input, url) in urls {
            let name = temp_name(input, url);
            if batch.insert(name.clone()) {
                temp.add(&name, url)?;
            }
            names.insert(input, name);
        }

        let batch: Vec<String> = batch.into_iter().collect();
        temp.update(&batch)?;

        let root = self.store_root.get(&self.exec)?;
        let mut locks = Vec::with_capacity(urls.len());
        for (input, name) in names {
            let source = temp.source_path(&name)?;
            let path = StorePath::parse(root, &source)
                .map_err(|e| e.for_channel(name.clone()))?;
            tracing::debug!(input = %input, store_path = %path, "measured");

            locks.push((
                input.clone(),
                ChannelLock {
                    url: urls[input].clone(),
                    store_hash: path.hash,
                },
            ));
        }

        Ok(locks)
    }
}

/// `<16 hex of sha256(url)>-<basename>`, a stable name per resolved URL
pub fn temp_name(input: &ChannelInput, url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let short = &hex::encode(digest)[..16];
    let base: String = input
        .url
        .basename()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", short, base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::GitRefLookup;
    use crate::exec::ExecContext;
    use crate::gateway::TEMP_PREFIX;
    use crate::testing::FakeNix;

    const NIXPKGS_REFS: &str = "\
1111111111111111111111111111111111111111\tHEAD
2222222222222222222222222222222222222222\trefs/heads/nixos-23.05
3333333333333333333333333333333333333333\trefs/heads/nixos-23.11
";

    fn input(text: &str) -> ChannelInput {
        text.parse().unwrap()
    }

    fn declared(items: &[&str]) -> BTreeSet<ChannelInput> {
        items.iter().map(|s| input(s)).collect()
    }

    struct Fixture {
        nix: FakeNix,
        ctx: ExecContext,
        store: StoreRoot,
    }

    impl Fixture {
        fn new() -> Self {
            let nix = FakeNix::new();
            nix.with_remote("https://github.com/NixOS/nixpkgs", NIXPKGS_REFS);
            let store = nix.store();
            Self {
                nix,
                ctx: ExecContext::new("alice"),
                store,
            }
        }

        fn reconcile(&self, declared: &BTreeSet<ChannelInput>, existing: &LockFile, mode: ReconcileMode, allow: bool) -> Result<LockFile> {
            let exec = Executor::new(&self.nix, &self.ctx);
            let lookup = GitRefLookup::new(exec);
            Reconciler::new(exec, &lookup, &self.store)
                .allow_hash_update(allow)
                .reconcile(declared, existing, mode)
        }

        fn temp_entries(&self) -> Vec<String> {
            self.nix
                .channels("alice")
                .into_keys()
                .filter(|n| n.starts_with(TEMP_PREFIX))
                .collect()
        }
    }

    #[test]
    fn test_full_update_locks_exactly_declared() {
        let fx = Fixture::new();
        let inputs = declared(&[
            "github:NixOS/nixpkgs nixos-23.11",
            "https://example.com/overlay.tar.gz",
        ]);

        let lock = fx.reconcile(&inputs, &LockFile::new(), ReconcileMode::FullUpdate, false).unwrap();

        assert_eq!(lock.channels.keys().cloned().collect::<BTreeSet<_>>(), inputs);
        for entry in lock.channels.values() {
            assert!(!entry.store_hash.as_str().is_empty());
        }
        assert_eq!(
            lock.get(&input("github:NixOS/nixpkgs nixos-23.11")).unwrap().url,
            "https://github.com/NixOS/nixpkgs/archive/3333333333333333333333333333333333333333.tar.gz"
        );
    }

    #[test]
    fn test_temp_entries_live_until_next_run() {
        let fx = Fixture::new();
        let first = declared(&["https://example.com/a.tar.gz", "https://example.com/b.tar.gz"]);

        fx.reconcile(&first, &LockFile::new(), ReconcileMode::FullUpdate, false).unwrap();
        // this run's own entries are still there
        assert_eq!(fx.temp_entries().len(), 2);

        let second = declared(&["https://example.com/c.tar.gz"]);
        fx.nix.clear_calls();
        fx.reconcile(&second, &LockFile::new(), ReconcileMode::FullUpdate, false).unwrap();

        // the next run removed them before adding its own
        let calls = fx.nix.calls();
        let first_add = calls.iter().position(|c| c.contains("--add")).unwrap();
        let removes = calls.iter().filter(|c| c.contains("--remove")).count();
        assert_eq!(removes, 2);
        assert!(calls[..first_add].iter().filter(|c| c.contains("--remove")).count() == 2);

        let left = fx.temp_entries();
        assert_eq!(left.len(), 1);
        assert!(left[0].ends_with("-c.tar.gz"));
    }

    #[test]
    fn test_single_batched_update() {
        let fx = Fixture::new();
        let inputs = declared(&["https://example.com/a.tar.gz", "https://example.com/b.tar.gz"]);
        fx.reconcile(&inputs, &LockFile::new(), ReconcileMode::FullUpdate, false).unwrap();

        let updates: Vec<String> = fx.nix.calls().into_iter().filter(|c| c.contains("--update")).collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].matches(TEMP_PREFIX).count(), 2);
    }

    #[test]
    fn test_missing_only_keeps_existing_locks() {
        let fx = Fixture::new();
        let a = declared(&["https://example.com/a.tar.gz"]);
        let existing = fx.reconcile(&a, &LockFile::new(), ReconcileMode::FullUpdate, false).unwrap();

        fx.nix.clear_calls();
        let same = fx.reconcile(&a, &existing, ReconcileMode::MissingOnly, false).unwrap();
        assert_eq!(same, existing);
        assert!(fx.nix.calls().is_empty());

        let both = declared(&["https://example.com/a.tar.gz", "https://example.com/b.tar.gz"]);
        let grown = fx.reconcile(&both, &existing, ReconcileMode::MissingOnly, false).unwrap();
        assert_eq!(grown.len(), 2);
        let adds = fx.nix.calls().into_iter().filter(|c| c.contains("--add")).count();
        assert_eq!(adds, 1);
    }

    #[test]
    fn test_locks_only_reuses_urls() {
        let fx = Fixture::new();
        let inputs = declared(&["github:NixOS/nixpkgs nixos-23.11"]);
        let existing = fx.reconcile(&inputs, &LockFile::new(), ReconcileMode::FullUpdate, false).unwrap();

        // the branch moves, but LocksOnly keeps the pinned URL
        fx.nix.with_remote(
            "https://github.com/NixOS/nixpkgs",
            "4444444444444444444444444444444444444444\trefs/heads/nixos-23.11\n",
        );
        fx.nix.clear_calls();
        let relocked = fx.reconcile(&inputs, &existing, ReconcileMode::LocksOnly, false).unwrap();
        assert_eq!(relocked, existing);
        assert!(!fx.nix.calls().iter().any(|c| c.starts_with("git ")));

        let updated = fx.reconcile(&inputs, &existing, ReconcileMode::FullUpdate, false).unwrap();
        assert!(updated.channels.values().all(|l| l.url.contains("4444444444")));
        assert_ne!(updated, existing);
    }

    #[test]
    fn test_changed_hash_fails_without_flag() {
        let fx = Fixture::new();
        let url = "https://example.com/a.tar.gz";
        let inputs = declared(&[url]);
        let existing = fx.reconcile(&inputs, &LockFile::new(), ReconcileMode::FullUpdate, false).unwrap();

        fx.nix.republish(url);
        let err = fx
            .reconcile(&inputs, &existing, ReconcileMode::LocksOnly, false)
            .unwrap_err();
        assert!(matches!(err, ChanlockError::HashChanged { .. }));
        assert_eq!(err.exit_code(), 5);

        let accepted = fx.reconcile(&inputs, &existing, ReconcileMode::LocksOnly, true).unwrap();
        assert_ne!(accepted, existing);
    }

    #[test]
    fn test_resolution_failure_aborts_before_gateway() {
        let fx = Fixture::new();
        let inputs = declared(&["github:NixOS/nixpkgs release-99.99"]);
        let err = fx
            .reconcile(&inputs, &LockFile::new(), ReconcileMode::FullUpdate, false)
            .unwrap_err();
        assert!(matches!(err.root(), ChanlockError::RefNotFound { .. }));
        assert!(!fx.nix.calls().iter().any(|c| c.starts_with("nix-channel")));
    }

    #[test]
    fn test_temp_name_shape() {
        let name = temp_name(&input("github:NixOS/nixpkgs nixos-23.11"), "https://x/y.tar.gz");
        let (hash, base) = name.split_once('-').unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(base, "nixpkgs");
        assert_eq!(name, temp_name(&input("github:NixOS/nixpkgs nixos-23.11"), "https://x/y.tar.gz"));
    }
}
