//! Configuration loading for Warden.
//!
//! Settings are resolved from a TOML file, a `.env` file and `WARDEN_*`
//! environment variables, in that order of increasing precedence, then
//! checked by the guard rails before an [`OrchestratorConfig`] is handed to
//! the runtime. Fatal problems surface as [`ConfigGuardRailError`]; anything
//! merely suspicious is reported through [`ConfigWarnings`].
//!
//! [`OrchestratorConfig`]: warden_core::OrchestratorConfig
#![allow(missing_docs)]

pub mod loader;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, ConfigMetadata};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
