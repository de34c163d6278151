pub mod apply;
pub mod channel;
pub mod config;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod lock;
pub mod reconcile;
pub mod registry;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use apply::{ApplyEngine, ApplyOptions, ApplyPhase, ApplyResult};
pub use channel::{
    ChannelInput, ChannelSet, ChannelUrl, Forge, GitRefLookup, RefLookup, ResolvedChannels,
    Scheme,
};
pub use config::{Config, FlakesConfig, UserConfig};
pub use error::{ChanlockError, Result};
pub use exec::{CancelFlag, CommandRunner, ExecContext, Executor, Identity, Invocation, SystemRunner};
pub use gateway::{ChannelGateway, TEMP_PREFIX};
pub use lock::{ChannelLock, LockFile};
pub use reconcile::{ReconcileMode, Reconciler};
pub use registry::{project, FlakeEntry, FlakeRef, Registry, RegistryFormat};
pub use state::{Backend, LockChanges, State, StatePaths};
pub use store::{StoreHash, StorePath, StoreRoot};
