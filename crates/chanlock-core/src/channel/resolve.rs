//! Channel input resolution
//!
//! Turns a declared [`ChannelInput`] into the URL handed to `nix-channel`.
//! Plain http(s) inputs pass through; VCS inputs are pinned to a commit and
//! rewritten to the forge's tarball endpoint.

use crate::error::{ChanlockError, Result};

use super::git::{looks_like_commit, RefLookup};
use super::types::{ChannelInput, Scheme};

/// A resolver for one [`Scheme`]
pub type Resolver = fn(&ChannelInput, &dyn RefLookup) -> Result<String>;

impl Scheme {
    /// The resolver responsible for this scheme
    pub fn resolver(self) -> Resolver {
        match self {
            Self::Http | Self::Https => resolve_same_url,
            Self::Git | Self::GitHub | Self::GitLab | Self::Sourcehut | Self::Gitea => resolve_vcs,
        }
    }
}

impl ChannelInput {
    /// Resolve this input to a concrete, fetchable URL
    pub fn resolve(&self, lookup: &dyn RefLookup) -> Result<String> {
        (self.scheme().resolver())(self, lookup).map_err(|e| ChanlockError::Resolve {
            input: self.to_string(),
            source: Box::new(e),
        })
    }
}

/// Code hosting services with a known archive layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forge {
    GitHub,
    GitLab,
    Sourcehut,
    Gitea,
}

impl Forge {
    pub fn default_host(&self) -> &'static str {
        match self {
            Self::GitHub => "github.com",
            Self::GitLab => "gitlab.com",
            Self::Sourcehut => "git.sr.ht",
            Self::Gitea => "gitea.com",
        }
    }

    fn from_scheme(scheme: Scheme) -> Option<Self> {
        match scheme {
            Scheme::GitHub => Some(Self::GitHub),
            Scheme::GitLab => Some(Self::GitLab),
            Scheme::Sourcehut => Some(Self::Sourcehut),
            Scheme::Gitea => Some(Self::Gitea),
            _ => None,
        }
    }

    fn from_host(host: &str) -> Result<Self> {
        [Self::GitHub, Self::GitLab, Self::Sourcehut, Self::Gitea]
            .into_iter()
            .find(|forge| forge.default_host() == host)
            .ok_or_else(|| ChanlockError::UnknownGitHost {
                host: host.to_string(),
            })
    }

    /// The tarball URL of `rev` in the repository at `host/path`
    pub fn archive_url(&self, host: &str, path: &str, rev: &str) -> String {
        match self {
            Self::GitLab => {
                let repo = path.rsplit('/').next().unwrap_or(path);
                format!("https://{host}/{path}/-/archive/{rev}/{repo}-{rev}.tar.gz")
            }
            Self::GitHub | Self::Sourcehut | Self::Gitea => {
                format!("https://{host}/{path}/archive/{rev}.tar.gz")
            }
        }
    }
}

/// A repository on a forge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRemote {
    pub forge: Forge,
    pub host: String,
    /// `owner/repo`, without leading slash or `.git` suffix
    pub path: String,
}

impl GitRemote {
    /// Canonicalize `scheme:owner/repo`, `scheme:host/owner/repo` and
    /// `git://host/owner/repo` forms.
    pub fn from_input(input: &ChannelInput) -> Result<Self> {
        let scheme = input.scheme();
        let url = input.url.url();

        let (host, path) = if url.cannot_be_a_base() {
            let opaque = url.path();
            let parts: Vec<&str> = opaque.split('/').collect();
            if parts.iter().any(|p| p.is_empty()) {
                return Err(ChanlockError::InvalidShorthand {
                    opaque: opaque.to_string(),
                });
            }
            match (parts.len(), Forge::from_scheme(scheme)) {
                (2, Some(forge)) => (forge.default_host().to_string(), parts.join("/")),
                (3, _) => (parts[0].to_string(), parts[1..].join("/")),
                _ => {
                    return Err(ChanlockError::InvalidShorthand {
                        opaque: opaque.to_string(),
                    })
                }
            }
        } else {
            let host = url
                .host_str()
                .ok_or_else(|| ChanlockError::InvalidInput {
                    input: input.url.to_string(),
                    reason: "missing host".to_string(),
                })?
                .to_string();
            (host, url.path().trim_matches('/').to_string())
        };

        let forge = match Forge::from_scheme(scheme) {
            Some(forge) => forge,
            None => Forge::from_host(&host)?,
        };

        let path = path.trim_end_matches(".git").to_string();
        if path.split('/').count() < 2 {
            return Err(ChanlockError::InvalidShorthand { opaque: path });
        }

        Ok(Self { forge, host, path })
    }

    /// The URL `git` can query for references
    pub fn clone_url(&self) -> String {
        format!("https://{}/{}", self.host, self.path)
    }
}

fn resolve_same_url(input: &ChannelInput, _lookup: &dyn RefLookup) -> Result<String> {
    Ok(input.url.to_string())
}

fn resolve_vcs(input: &ChannelInput, lookup: &dyn RefLookup) -> Result<String> {
    let remote = GitRemote::from_input(input)?;

    let rev = match input.version.as_deref() {
        Some(version) if looks_like_commit(version) => {
            tracing::warn!(input = %input, "pinned to a commit, not updating");
            version.to_string()
        }
        Some(version) => lookup.ref_commit(&remote.clone_url(), version)?,
        None => {
            tracing::warn!(input = %input, "no version given, pinning the remote HEAD");
            lookup.ref_commit(&remote.clone_url(), "HEAD")?
        }
    };

    Ok(remote.forge.archive_url(&remote.host, &remote.path, &rev))
}
