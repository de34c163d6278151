//! Remote reference lookup through `git ls-remote`

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{ChanlockError, Result};
use crate::exec::Executor;

/// Looks up the commit a reference points to on a remote
pub trait RefLookup: Sync {
    fn ref_commit(&self, remote: &str, reference: &str) -> Result<String>;
}

/// A reference advertised by a remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub commit: String,
    pub name: String,
}

/// [`RefLookup`] backed by the `git` binary
pub struct GitRefLookup<'a> {
    exec: Executor<'a>,
}

impl<'a> GitRefLookup<'a> {
    pub fn new(exec: Executor<'a>) -> Self {
        Self { exec }
    }
}

impl RefLookup for GitRefLookup<'_> {
    fn ref_commit(&self, remote: &str, reference: &str) -> Result<String> {
        let pattern = ls_remote_pattern(reference);
        let args = [
            "-c",
            "versionsort.suffix=-",
            "ls-remote",
            "--sort=v:refname",
            remote,
            pattern.as_str(),
        ]
        .map(String::from);

        let out = self.exec.run("git", &args)?;
        let refs = parse_ls_remote(&out);

        select_ref(&refs, reference)
            .map(|r| {
                tracing::debug!(remote, reference, matched = %r.name, commit = %r.commit, "resolved ref");
                r.commit.clone()
            })
            .ok_or_else(|| ChanlockError::RefNotFound {
                remote: remote.to_string(),
                reference: reference.to_string(),
            })
    }
}

/// Whether `version` can be used as a commit without asking the remote
pub fn looks_like_commit(version: &str) -> bool {
    (7..=40).contains(&version.len()) && version.chars().all(|c| c.is_ascii_hexdigit())
}

fn ls_remote_pattern(reference: &str) -> String {
    if reference.ends_with('*') && !reference.starts_with("refs/") {
        format!("refs/heads/{}", reference)
    } else {
        reference.to_string()
    }
}

/// Parse `git ls-remote` output.
///
/// Annotated tags are listed twice, once as the tag object and once peeled
/// (`refs/tags/v1^{}`); the peeled commit wins.
pub fn parse_ls_remote(out: &str) -> Vec<RemoteRef> {
    let mut peeled = HashMap::new();
    let mut refs = Vec::new();

    for line in out.lines() {
        let Some((commit, name)) = line.split_once('\t') else {
            continue;
        };
        let (commit, name) = (commit.trim(), name.trim());
        match name.strip_suffix("^{}") {
            Some(tag) => {
                peeled.insert(tag.to_string(), commit.to_string());
            }
            None => refs.push(RemoteRef {
                commit: commit.to_string(),
                name: name.to_string(),
            }),
        }
    }

    for r in &mut refs {
        if let Some(commit) = peeled.remove(&r.name) {
            r.commit = commit;
        }
    }

    refs
}

/// Pick the newest reference matching `selector`.
///
/// A trailing `*` matches by prefix (bare globs are branches); anything else
/// must equal the full ref name or one of its `/`-separated suffixes.
pub fn select_ref<'r>(refs: &'r [RemoteRef], selector: &str) -> Option<&'r RemoteRef> {
    let mut matches: Vec<&RemoteRef> = match selector.strip_suffix('*') {
        Some(_) => {
            let pattern = ls_remote_pattern(selector);
            let prefix = pattern.trim_end_matches('*');
            refs.iter().filter(|r| r.name.starts_with(prefix)).collect()
        }
        None => {
            let suffix = format!("/{}", selector);
            refs.iter()
                .filter(|r| r.name == selector || r.name.ends_with(&suffix))
                .collect()
        }
    };

    matches.sort_by(|a, b| version_cmp(&a.name, &b.name));
    matches.pop()
}

/// Compare two ref names so that embedded numbers sort numerically
/// (`nixos-9.03` < `nixos-23.11`).
///
/// Matches `git -c versionsort.suffix=-`: where the names first differ, the
/// side continuing with `-` sorts lower, so `nixos-24.05-small` and
/// `v2.0-rc1` come before `nixos-24.05` and `v2.0`.
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let common = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();
    let a_suffix = a.as_bytes().get(common) == Some(&b'-');
    let b_suffix = b.as_bytes().get(common) == Some(&b'-');
    match (a_suffix, b_suffix) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    let (mut a, mut b) = (a, b);
    loop {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }

        let (chunk_a, rest_a) = split_chunk(a);
        let (chunk_b, rest_b) = split_chunk(b);

        let a_digit = chunk_a.starts_with(|c: char| c.is_ascii_digit());
        let b_digit = chunk_b.starts_with(|c: char| c.is_ascii_digit());

        let ord = if a_digit && b_digit {
            let ta = chunk_a.trim_start_matches('0');
            let tb = chunk_b.trim_start_matches('0');
            ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb))
        } else {
            chunk_a.cmp(chunk_b)
        };

        if ord != Ordering::Equal {
            return ord;
        }
        a = rest_a;
        b = rest_b;
    }
}

fn split_chunk(s: &str) -> (&str, &str) {
    let digit = s.starts_with(|c: char| c.is_ascii_digit());
    let end = s
        .find(|c: char| c.is_ascii_digit() != digit)
        .unwrap_or(s.len());
    s.split_at(end)
}
