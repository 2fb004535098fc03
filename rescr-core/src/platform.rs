//! Platform-specific device discovery.
//!
//! Each submodule exposes the same `discover_devices` API so the rest of the
//! library never has to care which operating system it is on. Only Linux is
//! implemented today; a second platform would slot in behind the same
//! re-export.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
