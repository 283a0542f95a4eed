//! Shared types: errors, identifiers, configuration.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::Config;
pub use errors::{Error, FailKind, Result};
pub use ids::{InstanceId, ModuleId, PrincipalId};
