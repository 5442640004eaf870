/*!
 * Settings persistence
 * Bindings and paired-device summaries in one JSON file
 */

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use inkbt_core::{DeviceBindings, PairedDeviceSummary, Result, SettingsStore};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    device_bindings: DeviceBindings,
    #[serde(default)]
    paired_devices: Vec<PairedDeviceSummary>,
}

pub struct JsonSettings {
    path: PathBuf,
    contents: SettingsFile,
}

impl JsonSettings {
    /// Starts empty when the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let contents = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Ignoring corrupt settings {}: {}", path.display(), e);
                SettingsFile::default()
            }),
            Err(_) => {
                debug!("No settings at {}, starting fresh", path.display());
                SettingsFile::default()
            }
        };
        Self { path, contents }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.contents)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for JsonSettings {
    fn load_bindings(&self) -> DeviceBindings {
        self.contents.device_bindings.clone()
    }

    fn save_bindings(&mut self, bindings: &DeviceBindings) -> Result<()> {
        self.contents.device_bindings = bindings.clone();
        self.flush()
    }

    fn load_paired_devices(&self) -> Vec<PairedDeviceSummary> {
        self.contents.paired_devices.clone()
    }

    fn save_paired_devices(&mut self, devices: &[PairedDeviceSummary]) -> Result<()> {
        self.contents.paired_devices = devices.to_vec();
        self.flush()
    }
}
