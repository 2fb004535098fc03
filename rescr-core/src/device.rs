use std::fmt;
use std::path::PathBuf;

/// A block device discovered on the system.
///
/// Populated by the platform-specific scan in [`crate::platform`]; carries
/// what a selection menu needs to describe a flash target safely.
#[derive(Clone, Debug)]
pub struct Device {
    /// System path used for writing (e.g. `/dev/sdb`).
    pub path: PathBuf,
    /// Kernel name of the device (e.g. `sdb`).
    pub name: String,
    /// Total capacity in bytes.
    pub size_bytes: u64,
    /// Whether the kernel reports the device as removable.
    pub removable: bool,
    /// First mount point found for the device or any of its partitions.
    pub mount_point: Option<String>,
}

impl Device {
    /// Capacity in gigabytes, for display.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<15} {:>6.1} GB", self.path.display(), self.size_gb())?;
        if !self.removable {
            write!(f, " internal")?;
        }
        match &self.mount_point {
            Some(mp) => write!(f, " [mounted at {mp}]"),
            None => write!(f, " [not mounted]"),
        }
    }
}
