//! Channel input type definitions
//!
//! # Text form
//! ```text
//! <url>             https://nixos.org/channels/nixos-23.11/nixexprs.tar.xz
//! <url> <version>   github:NixOS/nixpkgs nixos-23.11
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::error::{ChanlockError, Result};

/// Supported URL schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Git,
    GitHub,
    GitLab,
    Sourcehut,
    Gitea,
    Http,
    Https,
}

impl Scheme {
    pub const ALL: [Scheme; 7] = [
        Self::Git,
        Self::GitHub,
        Self::GitLab,
        Self::Sourcehut,
        Self::Gitea,
        Self::Http,
        Self::Https,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Sourcehut => "gitsrht",
            Self::Gitea => "gitea",
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Whether inputs with this scheme are resolved through version control
    pub fn is_vcs(&self) -> bool {
        !matches!(self, Self::Http | Self::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ChanlockError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|scheme| scheme.as_str() == s)
            .ok_or_else(|| ChanlockError::UnknownScheme {
                scheme: s.to_string(),
            })
    }
}

/// The declared source URL of a channel, validated against [`Scheme`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelUrl {
    raw: String,
    url: Url,
    scheme: Scheme,
}

impl ChannelUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.chars().any(char::is_whitespace) {
            return Err(ChanlockError::InvalidInput {
                input: raw.to_string(),
                reason: "URL contains whitespace".to_string(),
            });
        }

        let url = Url::parse(raw).map_err(|e| ChanlockError::InvalidInput {
            input: raw.to_string(),
            reason: e.to_string(),
        })?;
        let scheme = url.scheme().parse::<Scheme>()?;

        Ok(Self {
            raw: raw.to_string(),
            url,
            scheme,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The last path segment, used to name temporary channels
    pub fn basename(&self) -> &str {
        let trimmed = self.raw.trim_end_matches('/');
        let tail = trimmed.rsplit('/').next().unwrap_or(trimmed);
        tail.rsplit(':').next().unwrap_or(tail)
    }
}

impl fmt::Display for ChannelUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A declared channel source: a URL plus an optional version selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelInput {
    pub url: ChannelUrl,
    /// Branch, tag, glob (`nixos-*`) or commit for VCS schemes
    pub version: Option<String>,
}

impl ChannelInput {
    pub fn new(url: ChannelUrl, version: Option<String>) -> Self {
        Self { url, version }
    }

    pub fn scheme(&self) -> Scheme {
        self.url.scheme()
    }
}

impl FromStr for ChannelInput {
    type Err = ChanlockError;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim();
        if text.is_empty() {
            return Err(ChanlockError::InvalidInput {
                input: s.to_string(),
                reason: "channel input string is empty".to_string(),
            });
        }

        let (url, version) = match text.split_once(' ') {
            Some((url, version)) => {
                let version = version.trim();
                (url, (!version.is_empty()).then(|| version.to_string()))
            }
            None => (text, None),
        };

        if version.as_deref().is_some_and(|v| v.contains(' ')) {
            return Err(ChanlockError::InvalidInput {
                input: s.to_string(),
                reason: "expected '<url>' or '<url> <version>'".to_string(),
            });
        }

        Ok(Self {
            url: ChannelUrl::parse(url)?,
            version,
        })
    }
}

impl fmt::Display for ChannelInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} {}", self.url, version),
            None => write!(f, "{}", self.url),
        }
    }
}

impl Serialize for ChannelInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
