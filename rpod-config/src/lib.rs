//! Configuration for the RPOD session service.
//!
//! Three concerns live here: the process-wide [`ServiceConfig`] (environment
//! defaults overridden by an optional YAML file), the static tier table that
//! maps a [`Tier`] to its resource shape and port policy, and the
//! [`UserDirectory`] that resolves usernames to profiles.

pub mod config;
pub mod error;
pub mod tier;
pub mod users;

pub use config::{BackendKind, ReusePolicy, ServiceConfig};
pub use error::{ConfigError, DirectoryError};
pub use tier::{Tier, TierLimits, TierTable};
pub use users::{
    ProjectGrant, StaticUserDirectory, UserDirectory, UserProfile, YamlUserDirectory,
};
