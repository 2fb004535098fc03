use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::device::Device;
use crate::error::{RecoveryError, Result};

/// Reads one attribute file under `/sys/block/<name>/`.
fn sysfs_attr(name: &str, attr: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(name).join(attr);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Strips a partition suffix (`/dev/sda1` to `/dev/sda`, `/dev/nvme0n1p2` to
/// `/dev/nvme0n1`) so the disk behind the root filesystem can be excluded
/// whole.
fn parent_disk(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();

    if s.starts_with("/dev/sd") || s.starts_with("/dev/vd") {
        if let Some(end) = s.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&s[..=end]);
        }
    } else if s.starts_with("/dev/mmcblk") || s.starts_with("/dev/nvme") {
        if let Some(sep) = s.rfind('p') {
            return PathBuf::from(&s[..sep]);
        }
    }

    path.to_path_buf()
}

/// Scans `/sys/block` for candidate flash targets.
///
/// The disk backing the root filesystem is always excluded, as are loop
/// devices and devices reporting zero capacity (typically empty card
/// readers). Non-removable disks are skipped too unless `include_fixed` is
/// set; a machine being rescued may well need its internal disk rewritten.
///
/// # Errors
///
/// [`RecoveryError::Discovery`] if the system disk cannot be identified, or
/// an I/O error if `/sys/block` is unreadable.
pub fn discover_devices(include_fixed: bool) -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let root_disk = disks
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .map(|d| parent_disk(&PathBuf::from("/dev/").join(d.name())))
        .ok_or_else(|| RecoveryError::Discovery("could not identify the system disk".into()))?;

    let entries =
        fs::read_dir("/sys/block").map_err(|e| RecoveryError::io("reading /sys/block", e))?;

    let mut devices = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = PathBuf::from("/dev/").join(&name);

        if name.starts_with("loop") || path == root_disk {
            continue;
        }

        let removable = sysfs_attr(&name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        if !removable && !include_fixed {
            continue;
        }

        let sectors: u64 = sysfs_attr(&name, "size")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if sectors == 0 {
            continue;
        }

        // The sysfs size attribute counts 512-byte sectors regardless of the
        // device's logical block size.
        let size_bytes = sectors * 512;

        let mount_point = disks
            .iter()
            .filter(|d| {
                PathBuf::from("/dev/")
                    .join(d.name())
                    .to_string_lossy()
                    .starts_with(&*path.to_string_lossy())
            })
            .map(|d| d.mount_point().to_string_lossy().to_string())
            .find(|mp| !mp.is_empty());

        devices.push(Device {
            path,
            name,
            size_bytes,
            removable,
            mount_point,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}
