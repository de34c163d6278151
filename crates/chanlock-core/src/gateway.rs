//! `nix-channel` gateway
//!
//! Every mutation of a user's channel list goes through [`ChannelGateway`].
//! A temporary gateway works in its own namespace (names prefixed with
//! [`TEMP_PREFIX`]) so hashes can be measured without touching live
//! channels:
//!
//! ```text
//! live:       nixpkgs, home-manager
//! temporary:  chanlock-tmp-3f1c0a9be2d47c11-nixpkgs
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{ChanlockError, Result};
use crate::exec::{Executor, Identity};

/// Name prefix of channels added only to measure their store hash
pub const TEMP_PREFIX: &str = "chanlock-tmp-";

const NIX_CHANNEL: &str = "nix-channel";

/// Channel operations for one identity within one namespace
#[derive(Clone)]
pub struct ChannelGateway<'a> {
    exec: Executor<'a>,
    identity: Identity,
    prefix: &'static str,
}

impl<'a> ChannelGateway<'a> {
    /// Gateway over the live channel list, which hides temporary entries
    pub fn new(exec: Executor<'a>, identity: Identity) -> Self {
        Self {
            exec,
            identity,
            prefix: "",
        }
    }

    /// Gateway over the temporary namespace
    pub fn temporary(exec: Executor<'a>, identity: Identity) -> Self {
        Self {
            exec,
            identity,
            prefix: TEMP_PREFIX,
        }
    }

    pub fn is_temporary(&self) -> bool {
        !self.prefix.is_empty()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn executor(&self) -> Executor<'a> {
        self.exec
    }

    /// The same identity and namespace on another executor
    pub fn rebind<'b>(&self, exec: Executor<'b>) -> ChannelGateway<'b> {
        ChannelGateway {
            exec,
            identity: self.identity.clone(),
            prefix: self.prefix,
        }
    }

    /// The name `nix-channel` knows this channel by
    pub fn full_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Add (or replace) a channel and return its full name
    pub fn add(&self, name: &str, url: &str) -> Result<String> {
        let full = self.full_name(name);
        self.nix_channel(&["--add", url, &full])?;
        Ok(full)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.nix_channel(&["--remove", &self.full_name(name)])?;
        Ok(())
    }

    /// Fetch the named channels. An empty list does nothing.
    pub fn update(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let full: Vec<String> = names.iter().map(|n| self.full_name(n)).collect();
        let mut args = vec!["--update"];
        args.extend(full.iter().map(String::as_str));
        self.nix_channel(&args)?;
        Ok(())
    }

    /// Fetch every channel of the identity
    pub fn update_all(&self) -> Result<()> {
        self.nix_channel(&["--update"])?;
        Ok(())
    }

    /// Channels in this gateway's namespace, name -> URL, with the prefix stripped
    pub fn list(&self) -> Result<BTreeMap<String, String>> {
        let out = self.nix_channel(&["--list"])?;
        let mut channels = BTreeMap::new();

        for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = line.split_whitespace();
            let (name, url) = match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(url), None) => (name, url),
                _ => {
                    return Err(ChanlockError::UnexpectedOutput {
                        command: format!("{} --list", NIX_CHANNEL),
                        line: line.to_string(),
                    })
                }
            };

            let visible = if self.is_temporary() {
                name.strip_prefix(self.prefix)
            } else if name.starts_with(TEMP_PREFIX) {
                None
            } else {
                Some(name)
            };

            if let Some(name) = visible {
                channels.insert(name.to_string(), url.to_string());
            }
        }

        Ok(channels)
    }

    /// Roll the channel profile back one generation
    pub fn rollback(&self) -> Result<()> {
        self.nix_channel(&["--rollback"])?;
        Ok(())
    }

    /// Remove every channel in this gateway's namespace and return their names
    pub fn remove_all(&self) -> Result<Vec<String>> {
        let names: Vec<String> = self.list()?.into_keys().collect();
        for name in &names {
            self.remove(name)?;
        }
        if !names.is_empty() {
            tracing::debug!(user = %self.identity, count = names.len(), "removed channels");
        }
        Ok(names)
    }

    /// The store path a fetched channel points to
    pub fn source_path(&self, name: &str) -> Result<PathBuf> {
        let link = self
            .home_dir()?
            .join(".nix-defexpr")
            .join("channels")
            .join(self.full_name(name));

        let out = self.exec.run_as(
            &self.identity,
            "readlink",
            &[link.to_string_lossy().into_owned()],
        )?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Home directory of the gateway's identity
    pub fn home_dir(&self) -> Result<PathBuf> {
        let ctx = self.exec.context();
        if ctx.is_current(&self.identity) {
            if let Some(home) = dirs::home_dir() {
                return Ok(home);
            }
        }

        let username = if self.identity.username.is_empty() {
            &ctx.current_user
        } else {
            &self.identity.username
        };
        let out = self
            .exec
            .run("getent", &["passwd".to_string(), username.clone()])
            .map_err(|_| ChanlockError::UnknownUser {
                username: username.clone(),
            })?;

        out.lines()
            .find_map(|line| {
                let fields: Vec<&str> = line.split(':').collect();
                (fields.len() >= 7 && fields[0] == username && !fields[5].is_empty())
                    .then(|| PathBuf::from(fields[5]))
            })
            .ok_or_else(|| ChanlockError::UnknownUser {
                username: username.clone(),
            })
    }

    fn nix_channel(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.exec.run_as(&self.identity, NIX_CHANNEL, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecContext;
    use crate::testing::FakeNix;

    #[test]
    fn test_temporary_namespace_is_isolated() {
        let nix = FakeNix::new();
        let ctx = ExecContext::new("alice");
        let exec = Executor::new(&nix, &ctx);

        let live = ChannelGateway::new(exec, Identity::new("alice"));
        let temp = ChannelGateway::temporary(exec, Identity::new("alice"));

        live.add("nixpkgs", "https://example.com/nixpkgs.tar.gz").unwrap();
        let full = temp.add("probe", "https://example.com/probe.tar.gz").unwrap();
        assert_eq!(full, "chanlock-tmp-probe");

        assert_eq!(live.list().unwrap().keys().collect::<Vec<_>>(), vec!["nixpkgs"]);
        assert_eq!(temp.list().unwrap().keys().collect::<Vec<_>>(), vec!["probe"]);

        assert_eq!(temp.remove_all().unwrap(), vec!["probe".to_string()]);
        assert!(temp.list().unwrap().is_empty());
        assert_eq!(live.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_rejects_garbage() {
        let nix = FakeNix::new();
        nix.set_list_output("alice", "nixpkgs https://a b\n");
        let ctx = ExecContext::new("alice");
        let gateway = ChannelGateway::new(Executor::new(&nix, &ctx), Identity::new("alice"));

        assert!(matches!(
            gateway.list().unwrap_err(),
            ChanlockError::UnexpectedOutput { .. }
        ));
    }

    #[test]
    fn test_other_user_requires_sudo() {
        let nix = FakeNix::new();
        let ctx = ExecContext::new("alice");
        let gateway = ChannelGateway::new(Executor::new(&nix, &ctx), Identity::new("root"));

        assert!(matches!(
            gateway.list().unwrap_err(),
            ChanlockError::EscalationDenied { .. }
        ));
        assert!(nix.calls().is_empty());
    }

    #[test]
    fn test_other_user_goes_through_sudo() {
        let nix = FakeNix::new();
        let ctx = ExecContext::new("alice");
        let gateway = ChannelGateway::new(
            Executor::new(&nix, &ctx),
            Identity::new("root").with_sudo(true),
        );

        gateway.add("nixos", "https://example.com/nixos.tar.gz").unwrap();
        assert_eq!(
            nix.calls(),
            vec!["sudo -u root nix-channel --add https://example.com/nixos.tar.gz nixos"]
        );
        assert_eq!(nix.channels("root").len(), 1);
        assert!(nix.channels("alice").is_empty());
    }

    #[test]
    fn test_update_and_source_path() {
        let nix = FakeNix::new();
        let ctx = ExecContext::new("alice");
        let gateway = ChannelGateway::temporary(Executor::new(&nix, &ctx), Identity::new("alice"));

        gateway.add("probe", "https://example.com/probe.tar.gz").unwrap();
        gateway.update(&["probe".to_string()]).unwrap();

        let path = gateway.source_path("probe").unwrap();
        assert!(path.starts_with(nix.store_root()));
        assert!(path.exists());
    }

    #[test]
    fn test_empty_update_is_noop() {
        let nix = FakeNix::new();
        let ctx = ExecContext::new("alice");
        let gateway = ChannelGateway::new(Executor::new(&nix, &ctx), Identity::new("alice"));

        gateway.update(&[]).unwrap();
        assert!(nix.calls().is_empty());
    }

    #[test]
    fn test_home_dir_of_other_user() {
        let nix = FakeNix::new();
        let ctx = ExecContext::new("alice");
        let gateway = ChannelGateway::new(
            Executor::new(&nix, &ctx),
            Identity::new("bob").with_sudo(true),
        );
        assert_eq!(gateway.home_dir().unwrap(), PathBuf::from("/home/bob"));

        let nobody = ChannelGateway::new(
            Executor::new(&nix, &ctx),
            Identity::new("ghost").with_sudo(true),
        );
        assert!(matches!(
            nobody.home_dir().unwrap_err(),
            ChanlockError::UnknownUser { .. }
        ));
    }
}
