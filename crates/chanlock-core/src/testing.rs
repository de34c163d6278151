//! In-memory stand-in for `nix-channel` and friends
//!
//! [`FakeNix`] answers the commands chanlock runs (`nix-channel`, `readlink`,
//! `git ls-remote`, `getent`, `nix-instantiate`) from per-user state and a
//! throwaway store directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::error::{ChanlockError, Result};
use crate::exec::{CommandRunner, ExecContext, Invocation};
use crate::store::{nixbase32, StoreRoot};

const KNOWN_USERS: [&str; 3] = ["alice", "bob", "root"];

#[derive(Debug, Default, Clone)]
struct Profile {
    /// name -> URL, as in ~/.nix-channels
    channels: BTreeMap<String, String>,
    /// name -> store path of the last fetch
    fetched: BTreeMap<String, PathBuf>,
    generations: Vec<BTreeMap<String, PathBuf>>,
}

#[derive(Default)]
struct FakeState {
    profiles: HashMap<String, Profile>,
    list_overrides: HashMap<String, String>,
    remotes: HashMap<String, String>,
    /// Bumped to make the same URL fetch different content
    revisions: HashMap<String, u32>,
    not_flakes: HashSet<String>,
    fail_add_on: Option<usize>,
    fail_update: bool,
    adds: usize,
    calls: Vec<String>,
}

pub struct FakeNix {
    store: TempDir,
    state: Mutex<FakeState>,
}

impl Default for FakeNix {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNix {
    pub fn new() -> Self {
        Self {
            store: TempDir::new().expect("create fake store"),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn store_root(&self) -> &Path {
        self.store.path()
    }

    /// A [`StoreRoot`] pointing at the fake store
    pub fn store(&self) -> StoreRoot {
        StoreRoot::fixed(self.store.path())
    }

    /// Serve `refs` (in `git ls-remote` format) for `remote`
    pub fn with_remote(&self, remote: &str, refs: &str) {
        self.lock().remotes.insert(remote.to_string(), refs.to_string());
    }

    /// Make the next fetch of `url` produce different content
    pub fn republish(&self, url: &str) {
        *self.lock().revisions.entry(url.to_string()).or_default() += 1;
    }

    /// Fetches of `url` will not contain a `flake.nix`
    pub fn without_flake_marker(&self, url: &str) {
        self.lock().not_flakes.insert(url.to_string());
    }

    /// Fail the `n`th `nix-channel --add` (1-based, counted from now)
    pub fn fail_add_on(&self, n: usize) {
        let mut state = self.lock();
        state.fail_add_on = Some(state.adds + n);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.lock().fail_update = fail;
    }

    /// Replace the output of `nix-channel --list` for `user`
    pub fn set_list_output(&self, user: &str, output: &str) {
        self.lock()
            .list_overrides
            .insert(user.to_string(), output.to_string());
    }

    /// Seed a live channel without recording a call
    pub fn seed_channel(&self, user: &str, name: &str, url: &str) {
        self.lock()
            .profiles
            .entry(user.to_string())
            .or_default()
            .channels
            .insert(name.to_string(), url.to_string());
    }

    /// Every channel of `user`, prefixed or not
    pub fn channels(&self, user: &str) -> BTreeMap<String, String> {
        self.lock()
            .profiles
            .get(user)
            .map(|p| p.channels.clone())
            .unwrap_or_default()
    }

    /// Command lines run so far
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// The store path `url` is currently fetched into
    pub fn store_path_for(&self, url: &str) -> PathBuf {
        let revision = self.lock().revisions.get(url).copied().unwrap_or(0);
        self.store.path().join(store_name(url, revision))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    fn nix_channel(&self, user: &str, args: &[String]) -> Result<String> {
        let mut state = self.lock();
        let command = format!("nix-channel {}", args.join(" "));

        match args.first().map(String::as_str) {
            Some("--add") if args.len() == 3 => {
                state.adds += 1;
                if state.fail_add_on == Some(state.adds) {
                    return Err(failure(&command, "simulated add failure"));
                }
                let profile = state.profiles.entry(user.to_string()).or_default();
                profile.channels.insert(args[2].clone(), args[1].clone());
                Ok(String::new())
            }
            Some("--remove") if args.len() == 2 => {
                let profile = state.profiles.entry(user.to_string()).or_default();
                profile.channels.remove(&args[1]);
                profile.fetched.remove(&args[1]);
                Ok(String::new())
            }
            Some("--list") => {
                if let Some(out) = state.list_overrides.get(user) {
                    return Ok(out.clone());
                }
                let profile = state.profiles.get(user).cloned().unwrap_or_default();
                Ok(profile
                    .channels
                    .iter()
                    .map(|(name, url)| format!("{} {}\n", name, url))
                    .collect())
            }
            Some("--update") => {
                if state.fail_update {
                    return Err(failure(&command, "simulated update failure"));
                }
                let revisions = state.revisions.clone();
                let not_flakes = state.not_flakes.clone();
                let profile = state.profiles.entry(user.to_string()).or_default();

                let names: Vec<String> = if args.len() > 1 {
                    args[1..].to_vec()
                } else {
                    profile.channels.keys().cloned().collect()
                };

                profile.generations.push(profile.fetched.clone());
                for name in names {
                    let url = profile
                        .channels
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| failure(&command, &format!("no channel '{}'", name)))?;
                    let revision = revisions.get(&url).copied().unwrap_or(0);
                    let path = self.store.path().join(store_name(&url, revision));
                    let source = path.join("source");
                    fs::create_dir_all(&source)?;
                    if !not_flakes.contains(&url) {
                        fs::write(source.join("flake.nix"), "{ outputs = _: { }; }\n")?;
                    }
                    profile.fetched.insert(name, path);
                }
                Ok(String::new())
            }
            Some("--rollback") => {
                let profile = state.profiles.entry(user.to_string()).or_default();
                match profile.generations.pop() {
                    Some(previous) => {
                        profile.fetched = previous;
                        Ok(String::new())
                    }
                    None => Err(failure(&command, "no generation to roll back to")),
                }
            }
            _ => Err(failure(&command, "unsupported arguments")),
        }
    }

    fn readlink(&self, user: &str, args: &[String]) -> Result<String> {
        let command = format!("readlink {}", args.join(" "));
        let name = args
            .first()
            .and_then(|link| Path::new(link).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| failure(&command, "missing operand"))?;

        let state = self.lock();
        state
            .profiles
            .get(user)
            .and_then(|p| p.fetched.get(&name))
            .map(|path| format!("{}\n", path.display()))
            .ok_or_else(|| ChanlockError::ProcessFailed {
                command,
                status: "exit status: 1".to_string(),
            })
    }

    fn git(&self, args: &[String]) -> Result<String> {
        let command = format!("git {}", args.join(" "));
        let remote = args
            .iter()
            .position(|a| a == "ls-remote")
            .and_then(|i| args.get(i + 2))
            .ok_or_else(|| failure(&command, "unsupported arguments"))?;

        self.lock()
            .remotes
            .get(remote)
            .cloned()
            .ok_or_else(|| failure(&command, "repository not found"))
    }

    fn getent(&self, args: &[String]) -> Result<String> {
        match args {
            [db, user] if db == "passwd" && KNOWN_USERS.contains(&user.as_str()) => {
                let home = if user == "root" {
                    "/root".to_string()
                } else {
                    format!("/home/{}", user)
                };
                Ok(format!("{user}:x:1000:100::{home}:/bin/sh\n"))
            }
            _ => Err(ChanlockError::ProcessFailed {
                command: format!("getent {}", args.join(" ")),
                status: "exit status: 2".to_string(),
            }),
        }
    }
}

impl CommandRunner for FakeNix {
    fn run(&self, ctx: &ExecContext, invocation: &Invocation) -> Result<String> {
        self.lock().calls.push(invocation.to_string());

        if ctx.cancel.is_cancelled() {
            return Err(ChanlockError::Cancelled {
                command: invocation.to_string(),
            });
        }

        let user = invocation
            .sudo_user()
            .unwrap_or(&ctx.current_user)
            .to_string();
        let (program, args) = invocation.target();

        match program {
            "nix-channel" => self.nix_channel(&user, args),
            "readlink" => self.readlink(&user, args),
            "git" => self.git(args),
            "getent" => self.getent(args),
            "nix-instantiate" => Ok(format!("\"{}\"\n", self.store.path().display())),
            other => Err(failure(other, "command not found")),
        }
    }
}

/// Deterministic `<hash>-source` store entry name for a URL
fn store_name(url: &str, revision: u32) -> String {
    let digest = Sha256::digest(format!("{}#{}", url, revision).as_bytes());
    format!("{}-source", nixbase32::encode(&digest[..20]))
}

fn failure(command: &str, stderr: &str) -> ChanlockError {
    ChanlockError::CommandFailed {
        command: command.to_string(),
        code: 1,
        stderr: stderr.to_string(),
    }
}
