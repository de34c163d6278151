use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChanlockError {
    // ---- configuration ----
    #[error("Failed to parse {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Invalid channel input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    #[error("Unknown URL scheme '{scheme}' (expected git, github, gitlab, gitsrht, gitea, http or https)")]
    UnknownScheme { scheme: String },

    #[error("Alias '{alias}' points to unknown channel '{target}'")]
    UnknownAlias { alias: String, target: String },

    #[error("Alias cycle detected at '{alias}'")]
    AliasCycle { alias: String },

    #[error("Invalid shorthand '{opaque}': expected owner/repo or host/owner/repo")]
    InvalidShorthand { opaque: String },

    #[error("Unknown git service '{host}', consider using https:// instead")]
    UnknownGitHost { host: String },

    #[error("Unknown user '{username}'")]
    UnknownUser { username: String },

    #[error("Channel '{channel}' is not declared")]
    UnknownChannel { channel: String },

    // ---- resolution ----
    #[error("Ref '{reference}' not found in {remote}")]
    RefNotFound { remote: String, reference: String },

    #[error("Cannot resolve '{input}': {source}")]
    Resolve {
        input: String,
        #[source]
        source: Box<ChanlockError>,
    },

    // ---- gateway ----
    #[error("{command} exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("{command} failed: {status}")]
    ProcessFailed { command: String, status: String },

    #[error("Cannot run as user '{username}': use-sudo is not enabled")]
    EscalationDenied { username: String },

    #[error("Interrupted while running {command}")]
    Cancelled { command: String },

    #[error("Cannot parse line {line:?} from {command}")]
    UnexpectedOutput { command: String, line: String },

    // ---- consistency ----
    #[error("Store hash of '{input}' changed from {old} to {new}; rerun with --allow-hash-update to accept it")]
    HashChanged {
        input: String,
        old: String,
        new: String,
    },

    // ---- format ----
    #[error("Invalid store path name '{name}'")]
    InvalidStoreName { name: String },

    #[error("Invalid nixbase32 store hash '{hash}'")]
    InvalidStoreHash { hash: String },

    #[error("No store path found for hash '{hash}' in {root}")]
    StorePathNotFound { root: PathBuf, hash: String },

    // ---- projection ----
    #[error("Channel '{channel}' has no lock, run chanlock --update-locks first")]
    MissingLock { channel: String },

    #[error("Channel '{channel}' is not a flake: {path} does not exist")]
    MissingFlakeMarker { channel: String, path: PathBuf },

    // ---- context ----
    #[error("User '{username}': {source}")]
    User {
        username: String,
        #[source]
        source: Box<ChanlockError>,
    },

    #[error("Channel '{channel}': {source}")]
    Channel {
        channel: String,
        #[source]
        source: Box<ChanlockError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChanlockError>;

impl ChanlockError {
    /// Wrap an error with the user it happened for
    pub fn for_user(self, username: impl Into<String>) -> Self {
        Self::User {
            username: username.into(),
            source: Box::new(self),
        }
    }

    /// Wrap an error with the channel it happened for
    pub fn for_channel(self, channel: impl Into<String>) -> Self {
        Self::Channel {
            channel: channel.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &ChanlockError {
        match self {
            Self::User { source, .. } | Self::Channel { source, .. } | Self::Resolve { source, .. } => {
                source.root()
            }
            other => other,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Self::ConfigParse { .. }
            | Self::InvalidInput { .. }
            | Self::UnknownScheme { .. }
            | Self::UnknownAlias { .. }
            | Self::AliasCycle { .. }
            | Self::InvalidShorthand { .. }
            | Self::UnknownGitHost { .. }
            | Self::UnknownUser { .. }
            | Self::UnknownChannel { .. } => 2,
            Self::RefNotFound { .. } => 3,
            Self::CommandFailed { .. }
            | Self::ProcessFailed { .. }
            | Self::EscalationDenied { .. }
            | Self::UnexpectedOutput { .. } => 4,
            Self::HashChanged { .. } => 5,
            Self::InvalidStoreName { .. }
            | Self::InvalidStoreHash { .. }
            | Self::StorePathNotFound { .. } => 6,
            Self::MissingLock { .. } | Self::MissingFlakeMarker { .. } => 7,
            Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }
}
