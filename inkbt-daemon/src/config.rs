use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use inkbt_core::bus::DEFAULT_ADAPTER_PATH;
use inkbt_core::controller::{ControllerSettings, RESUME_POLL_ATTEMPTS};
use inkbt_core::input::{DEFAULT_DEV_INPUT_DIR, DEFAULT_INPUT_PATH, DEFAULT_SYS_CLASS_INPUT};
use inkbt_core::{ActionCatalog, BusProfile, CommandRunner};

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub settings_path: String,
    pub actions_path: String,
    pub bluetooth: BluetoothConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileSetting {
    Auto,
    Vendor,
    Standard,
}

impl ProfileSetting {
    pub fn resolve(self, runner: &dyn CommandRunner) -> BusProfile {
        match self {
            ProfileSetting::Auto => BusProfile::detect(runner),
            ProfileSetting::Vendor => BusProfile::Vendor,
            ProfileSetting::Standard => BusProfile::Standard,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// False on hardware without a Bluetooth radio.
    pub enabled: bool,
    pub profile: ProfileSetting,
    pub adapter_path: String,
    pub auto_resume: bool,
    pub scan_seconds: u64,
    pub resume_attempts: u32,
    pub resume_interval_ms: u64,
    pub input_dir: String,
    pub sys_class_input: String,
    pub default_input_path: String,
}

/// Shell snippets run through `sh -c`. Empty means "nothing to do".
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HooksConfig {
    pub wifi_on: String,
    pub wifi_off: String,
    pub wifi_status: String,
    pub prevent_standby: String,
    pub allow_standby: String,
    /// The host brings Wi-Fi back by itself after resume.
    pub wifi_restore: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/inkbt/inkbt.sock".to_string(),
            settings_path: "/var/lib/inkbt/settings.json".to_string(),
            actions_path: "/etc/inkbt/actions.toml".to_string(),
            bluetooth: BluetoothConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            profile: ProfileSetting::Auto,
            adapter_path: DEFAULT_ADAPTER_PATH.to_string(),
            auto_resume: true,
            scan_seconds: 10,
            resume_attempts: RESUME_POLL_ATTEMPTS,
            resume_interval_ms: 500,
            input_dir: DEFAULT_DEV_INPUT_DIR.to_string(),
            sys_class_input: DEFAULT_SYS_CLASS_INPUT.to_string(),
            default_input_path: DEFAULT_INPUT_PATH.to_string(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            wifi_on: "rfkill unblock wifi".to_string(),
            wifi_off: "rfkill block wifi".to_string(),
            wifi_status: "rfkill list wifi | grep -q 'Soft blocked: no'".to_string(),
            prevent_standby: String::new(),
            allow_standby: String::new(),
            wifi_restore: false,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str(&content).with_context(|| format!("invalid config {}", path))
            }
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Err(e) = fs::write(path, toml::to_string_pretty(&config)?) {
                    tracing::debug!("Could not write default config to {}: {}", path, e);
                }
                Ok(config)
            }
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            auto_resume: self.bluetooth.auto_resume,
            scan_duration: Duration::from_secs(self.bluetooth.scan_seconds),
            resume_attempts: self.bluetooth.resume_attempts,
            resume_interval: Duration::from_millis(self.bluetooth.resume_interval_ms),
        }
    }
}

/// A missing catalog is not fatal: devices still connect, nothing can be bound.
pub fn load_catalog(path: &str) -> Result<ActionCatalog> {
    match fs::read_to_string(path) {
        Ok(content) => {
            toml::from_str(&content).with_context(|| format!("invalid action catalog {}", path))
        }
        Err(e) => {
            tracing::warn!("No action catalog at {} ({}), bindings disabled", path, e);
            Ok(ActionCatalog::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            socket_path = "/tmp/inkbt.sock"

            [bluetooth]
            profile = "vendor"
            scan_seconds = 30

            [hooks]
            wifi_restore = true
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, "/tmp/inkbt.sock");
        assert_eq!(config.bluetooth.profile, ProfileSetting::Vendor);
        assert_eq!(config.bluetooth.adapter_path, "/org/bluez/hci0");
        assert!(config.hooks.wifi_restore);
        assert_eq!(config.hooks.wifi_on, "rfkill unblock wifi");

        let settings = config.controller_settings();
        assert_eq!(settings.scan_duration, Duration::from_secs(30));
        assert_eq!(settings.resume_attempts, 20);
    }

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inkbtd.toml");
        let config = DaemonConfig::load(path.to_str().unwrap()).unwrap();
        assert!(config.bluetooth.enabled);

        let written: DaemonConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.settings_path, config.settings_path);
    }

    #[test]
    fn catalog_reads_nested_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.toml");
        fs::write(
            &path,
            r#"
            [[category]]
            name = "reader"

            [[category.action]]
            id = "next_page"
            title = "Next page"
            event = "GotoViewRel"
            args = 1

            [[category.action]]
            id = "toggle_frontlight"
            title = "Toggle frontlight"
            event = "ToggleFrontlight"
            toggle = ["on", "off"]
            "#,
        )
        .unwrap();

        let catalog = load_catalog(path.to_str().unwrap()).unwrap();
        assert_eq!(catalog.categories.len(), 1);
        assert_eq!(catalog.categories[0].actions[0].args, Some(serde_json::json!(1)));
        assert!(load_catalog("/nonexistent/actions.toml").unwrap().categories.is_empty());
    }
}
