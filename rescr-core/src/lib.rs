//! The core, UI-agnostic library for the `rescr` disk recovery toolkit.
//!
//! `rescr-core` is designed to be used by any front-end, whether the bundled
//! command-line interface (`rescr`) or something else entirely. It covers the
//! whole recovery workflow: journalled external commands, configuration
//! backup and restore, a network reachability probe, and flashing an OS
//! image onto a device through a chain of fallback methods with bounded
//! retries.
//!
//! The library is structured into several key modules:
//! - [`journal`]: The append-only event journal every component writes to.
//! - [`error`]: The shared failure taxonomy, including which failures are
//!   worth retrying.
//! - [`exec`]: Runs external commands with captured output and deadlines.
//! - [`backup`]: Copies configuration files aside and restores them.
//! - [`net`]: Checks network reachability with a ping probe.
//! - [`flash`]: Writes images to devices through a fallback chain of
//!   [`flash::FlashMethod`] strategies.
//! - [`retry`]: Re-runs failed operations a bounded number of times.
//! - [`device`] and [`platform`]: Block-device discovery for target pickers.
//!
//! Flash progress is reported through a callback, allowing the calling
//! application to display it in any way it chooses.
//!
//! ## Example: Flashing an Image with Retries
//!
//! ```rust,no_run
//! use rescr_core::flash::Flasher;
//! use rescr_core::journal::Journal;
//! use rescr_core::retry::{self, RetryPolicy};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! fn main() -> rescr_core::error::Result<()> {
//!     let journal = Arc::new(Journal::open("recovery.log")?);
//!     let devices = rescr_core::platform::discover_devices(false)?;
//!     let target = devices.first().expect("no removable devices found");
//!
//!     let flasher = Flasher::new(Arc::clone(&journal)).verify(true);
//!     retry::retry(&journal, RetryPolicy::flashing(), "flash", || {
//!         flasher.flash(Path::new("rescue.iso"), &target.path)
//!     })
//! }
//! ```

pub mod backup;
pub mod device;
pub mod error;
pub mod exec;
pub mod flash;
pub mod journal;
pub mod net;
pub mod platform;
pub mod retry;
