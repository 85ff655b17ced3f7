//! Video device discovery
//!
//! Scans `<sysfs>/class/video4linux/video*` and reads each device's `name`.
//! Never opens a device node.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name used when the device does not report one
const UNKNOWN_NAME: &str = "Unknown Camera";

/// Name fragments of internal ISP / codec helper nodes
const EXCLUDED: [&str; 2] = ["isp", "codec"];

/// A discovered capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraDevice {
    pub path: PathBuf,
    pub name: String,
}

/// Where to look for devices
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

impl DeviceRegistry {
    pub fn new(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// List capture devices, sorted by device path. A missing
    /// `video4linux` class directory means no devices.
    pub fn discover(&self) -> io::Result<Vec<CameraDevice>> {
        let class_dir = self.sysfs_root.join("class").join("video4linux");
        let entries = match std::fs::read_dir(&class_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            let node = entry.file_name().to_string_lossy().into_owned();
            if !node.starts_with("video") {
                continue;
            }

            let name = read_name(&entry.path());
            if is_helper(&name) {
                debug!("Skipping helper device {} ({})", node, name);
                continue;
            }

            devices.push(CameraDevice {
                path: self.dev_root.join(&node),
                name,
            });
        }

        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    /// Look up the name of a specific device node
    pub fn describe(&self, path: &Path) -> CameraDevice {
        let name = path
            .file_name()
            .map(|node| {
                read_name(&self.sysfs_root.join("class").join("video4linux").join(node))
            })
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());

        CameraDevice {
            path: path.to_path_buf(),
            name,
        }
    }
}

fn read_name(sysfs_dir: &Path) -> String {
    std::fs::read_to_string(sysfs_dir.join("name"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_NAME.to_string())
}

fn is_helper(name: &str) -> bool {
    let lower = name.to_lowercase();
    EXCLUDED.iter().any(|fragment| lower.contains(fragment))
}
