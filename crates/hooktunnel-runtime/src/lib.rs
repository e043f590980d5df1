//! External runtime support for public exposure
//!
//! - [`Bootstrapper`] finds `npx` or installs a checksum-verified portable
//!   Node.js LTS release.
//! - [`ExposureLauncher`] runs localtunnel through that runner and captures
//!   the public URL it prints.

mod bootstrap;
mod error;
mod launcher;
pub mod platform;

pub use bootstrap::{
    expected_checksum, prompt_yes_no, Bootstrapper, BundledNode, ResolvedRunner, NODE_DIST_URL,
};
pub use error::{Result, RuntimeError};
pub use launcher::{detach, ExposureLauncher, PublicExposure, DEFAULT_URL_TIMEOUT, LOCALTUNNEL};
pub use platform::Platform;
