//! Platform plumbing shared by the launcher, the core and the update helper.
//!
//! - Per-OS application directories.
//! - The `(os, arch)` identity used to address remote artifacts.
//! - Process helpers: hidden console windows and fully detached launches.

mod commands;
mod paths;
mod platform;

pub use commands::{HideWindow, launch_detached};
pub use paths::{AppPaths, AppPathsError};
pub use platform::{Arch, Os, Platform};
