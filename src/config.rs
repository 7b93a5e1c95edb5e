//! Loads and re-loads `site_devices.json`, `sos_templates_modbus.json`, and
//! `background.json`, and rebuilds the (port, slave) -> device mapping the
//! Decoder reads. See SPEC_FULL.md §6 and §9 ("Mapping reload race").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Deserialize;

use crate::error::{Result, WiretapError};
use crate::logging::tlog;
use crate::model::{DeviceMapping, Mapping, TemplateEntry};

#[derive(Debug, Clone, Deserialize)]
struct NetworkParams {
    comm_id: u8,
}

#[derive(Debug, Clone, Deserialize)]
struct Network {
    params: NetworkParams,
}

#[derive(Debug, Clone, Deserialize)]
struct SiteDevice {
    daq_name: String,
    device_type: String,
    daq_template: String,
    /// Serial port this device is tapped on, or absent/null/empty/"None"
    /// when not wiretapped (all four forms appear in the source data).
    #[serde(default)]
    wiretapped: Option<String>,
    network: Network,
}

impl SiteDevice {
    fn is_wiretapped(&self) -> Option<&str> {
        match self.wiretapped.as_deref() {
            None | Some("") | Some("None") => None,
            Some(port) => Some(port),
        }
    }
}

/// `device_type -> device_name -> SiteDevice`
type SiteDevicesFile = HashMap<String, HashMap<String, SiteDevice>>;

/// `device_type -> template_name -> entries`
type TemplatesFile = HashMap<String, HashMap<String, Vec<TemplateEntry>>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortList {
    One(String),
    Many(Vec<String>),
}

impl PortList {
    fn into_vec(self) -> Vec<String> {
        match self {
            PortList::One(p) => vec![p],
            PortList::Many(ps) => ps,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Parameters {
    #[serde(alias = "portRecieve")]
    port_receive: PortList,
    #[serde(default = "default_clear_interval")]
    clear_interval: u64,
}

fn default_clear_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
struct ModbusRtuWiretapSection {
    parameters: Parameters,
}

#[derive(Debug, Clone, Deserialize)]
struct BackgroundFile {
    modbus_rtu_wiretap: ModbusRtuWiretapSection,
}

#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    pub ports: Vec<String>,
    pub clear_interval: chrono::Duration,
}

pub fn load_background(path: &Path) -> Result<BackgroundConfig> {
    let text = std::fs::read_to_string(path)?;
    let parsed: BackgroundFile =
        serde_json::from_str(&text).map_err(|source| WiretapError::Config {
            path: path.display().to_string(),
            source,
        })?;
    let params = parsed.modbus_rtu_wiretap.parameters;
    Ok(BackgroundConfig {
        ports: params.port_receive.into_vec(),
        clear_interval: chrono::Duration::seconds(params.clear_interval as i64),
    })
}

/// Watches `site_devices.json` and `sos_templates_modbus.json` by mtime and
/// rebuilds `Mapping` off-line on change, so the Controller can publish it
/// via an atomic pointer swap rather than mutating a shared map in place.
pub struct MappingWatcher {
    site_devices_path: PathBuf,
    templates_path: PathBuf,
    site_devices_mtime: Option<SystemTime>,
    templates_mtime: Option<SystemTime>,
}

impl MappingWatcher {
    pub fn new(site_devices_path: PathBuf, templates_path: PathBuf) -> Self {
        Self {
            site_devices_path,
            templates_path,
            site_devices_mtime: None,
            templates_mtime: None,
        }
    }

    /// Returns `Some(new_mapping)` if either file changed (or this is the
    /// first call) and both could be loaded; `None` if nothing changed.
    /// A load error keeps the previous mapping in place (the caller simply
    /// doesn't swap) and logs a warning, per §7's config-reload policy.
    pub fn reload_if_changed(&mut self) -> Option<Mapping> {
        let site_mtime = std::fs::metadata(&self.site_devices_path)
            .and_then(|m| m.modified())
            .ok();
        let templates_mtime = std::fs::metadata(&self.templates_path)
            .and_then(|m| m.modified())
            .ok();

        let changed = site_mtime != self.site_devices_mtime
            || templates_mtime != self.templates_mtime
            || (self.site_devices_mtime.is_none() && self.templates_mtime.is_none());

        if !changed {
            return None;
        }

        match self.build() {
            Ok(mapping) => {
                self.site_devices_mtime = site_mtime;
                self.templates_mtime = templates_mtime;
                Some(mapping)
            }
            Err(e) => {
                tlog!(
                    "[config] failed to reload mapping, keeping previous mapping: {}",
                    e
                );
                None
            }
        }
    }

    fn build(&self) -> Result<Mapping> {
        let devices_text = std::fs::read_to_string(&self.site_devices_path)?;
        let devices: SiteDevicesFile =
            serde_json::from_str(&devices_text).map_err(|source| WiretapError::Config {
                path: self.site_devices_path.display().to_string(),
                source,
            })?;

        let templates_text = std::fs::read_to_string(&self.templates_path)?;
        let templates: TemplatesFile =
            serde_json::from_str(&templates_text).map_err(|source| WiretapError::Config {
                path: self.templates_path.display().to_string(),
                source,
            })?;

        let mut mapping: Mapping = HashMap::new();

        for per_type in devices.values() {
            for device in per_type.values() {
                let Some(port) = device.is_wiretapped() else {
                    continue;
                };
                let entries = templates
                    .get(&device.device_type)
                    .and_then(|by_template| by_template.get(&device.daq_template))
                    .cloned()
                    .unwrap_or_default();

                mapping.entry(port.to_string()).or_default().insert(
                    device.network.params.comm_id,
                    DeviceMapping {
                        daq_name: Arc::from(device.daq_name.as_str()),
                        templates: Arc::new(entries),
                    },
                );
            }
        }

        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn background_parses_single_port_and_legacy_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("background.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"modbus_rtu_wiretap":{{"parameters":{{"portRecieve":"/dev/ttyUSB0","clear_interval":120}}}}}}"#
        )
        .unwrap();
        let cfg = load_background(&path).unwrap();
        assert_eq!(cfg.ports, vec!["/dev/ttyUSB0".to_string()]);
        assert_eq!(cfg.clear_interval, chrono::Duration::seconds(120));
    }

    #[test]
    fn background_parses_port_list_and_defaults_clear_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("background.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"modbus_rtu_wiretap":{{"parameters":{{"port_receive":["/dev/ttyUSB0","/dev/ttyUSB1"]}}}}}}"#
        )
        .unwrap();
        let cfg = load_background(&path).unwrap();
        assert_eq!(cfg.ports.len(), 2);
        assert_eq!(cfg.clear_interval, chrono::Duration::seconds(300));
    }

    fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn mapping_excludes_devices_not_wiretapped() {
        let dir = tempfile::tempdir().unwrap();
        let devices = write_fixture(
            dir.path(),
            "site_devices.json",
            r#"{
                "inverter": {
                    "inv-1": {"daq_name": "inv-1", "device_type": "inverter", "daq_template": "default",
                               "wiretapped": "/dev/ttyUSB0", "network": {"params": {"comm_id": 1}}},
                    "inv-2": {"daq_name": "inv-2", "device_type": "inverter", "daq_template": "default",
                               "wiretapped": null, "network": {"params": {"comm_id": 2}}}
                }
            }"#,
        );
        let templates = write_fixture(
            dir.path(),
            "sos_templates_modbus.json",
            r#"{"inverter": {"default": []}}"#,
        );

        let mut watcher = MappingWatcher::new(devices, templates);
        let mapping = watcher.reload_if_changed().expect("first load should build");
        assert_eq!(mapping.len(), 1);
        assert!(mapping.contains_key("/dev/ttyUSB0"));
        assert_eq!(mapping["/dev/ttyUSB0"].len(), 1);
        assert!(mapping["/dev/ttyUSB0"].contains_key(&1));
    }

    #[test]
    fn unchanged_files_do_not_trigger_a_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let devices = write_fixture(dir.path(), "site_devices.json", r#"{}"#);
        let templates = write_fixture(dir.path(), "sos_templates_modbus.json", r#"{}"#);
        let mut watcher = MappingWatcher::new(devices, templates);
        assert!(watcher.reload_if_changed().is_some());
        assert!(watcher.reload_if_changed().is_none());
    }
}
