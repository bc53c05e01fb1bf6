use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::signal::ChannelMapping;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppSettings {
    #[serde(default = "default_can_interface")]
    pub can_interface: String,
    #[serde(default = "default_can_bitrate")]
    pub can_bitrate: String, // decimal string, one of the nine standard rates
    #[serde(default = "default_can_cmd")]
    pub can_cmd: String, // candump path; present means the shell backend is used
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default)]
    pub replay_file: Option<String>,
    #[serde(default = "default_replay_spacing_ms")]
    pub replay_spacing_ms: u64,
    #[serde(default)]
    pub replay_repeat: bool,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_mappings_file")]
    pub mappings_file: String,
}

fn default_can_interface() -> String {
    "can0".to_string()
}
fn default_can_bitrate() -> String {
    "250000".to_string()
}
fn default_can_cmd() -> String {
    "/usr/bin/candump".to_string()
}
fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_replay_spacing_ms() -> u64 {
    100
}
fn default_log_dir() -> String {
    config_dir().join("logs").to_string_lossy().to_string()
}
fn default_mappings_file() -> String {
    config_dir().join("mappings.toml").to_string_lossy().to_string()
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chicane")
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            can_interface: default_can_interface(),
            can_bitrate: default_can_bitrate(),
            can_cmd: default_can_cmd(),
            serial_port: default_serial_port(),
            replay_file: None,
            replay_spacing_ms: default_replay_spacing_ms(),
            replay_repeat: false,
            log_to_file: false,
            log_dir: default_log_dir(),
            mappings_file: default_mappings_file(),
        }
    }
}

fn get_settings_path() -> Result<PathBuf, String> {
    let app_dir = config_dir();

    std::fs::create_dir_all(&app_dir)
        .map_err(|e| format!("Failed to create config dir: {}", e))?;

    Ok(app_dir.join("settings.json"))
}

pub fn load_settings() -> Result<AppSettings, String> {
    let settings_path = get_settings_path()?;

    if settings_path.exists() {
        let content = std::fs::read_to_string(&settings_path)
            .map_err(|e| format!("Failed to read settings: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
    } else {
        // First run: write default settings and an example mapping file
        let settings = AppSettings::default();
        install_default_mappings(&settings)?;
        save_settings(&settings)?;
        Ok(settings)
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    let settings_path = get_settings_path()?;

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    std::fs::write(&settings_path, content)
        .map_err(|e| format!("Failed to write settings: {}", e))
}

const DEFAULT_MAPPINGS_TOML: &str = r#"# chicane virtual channel mappings
#
# Each [[channel]] block maps one engineering value into a field of a
# broadcast CAN frame. offset and length are in bytes; offset 0 is the
# last byte of an 8 byte frame.

[[channel]]
id = 1
can_id = 0x100
offset = 0
length = 2
source_type = "unsigned"
formula_multiplier = 10.0
virtual_frequency_ms = 100
channel_name = "coolant_temp"
"#;

/// Write the bundled example mapping file. Never overwrites.
pub fn install_default_mappings(settings: &AppSettings) -> Result<(), String> {
    let mappings_path = PathBuf::from(&settings.mappings_file);
    if mappings_path.exists() {
        return Ok(());
    }

    if let Some(parent) = mappings_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create mappings dir: {}", e))?;
    }

    std::fs::write(&mappings_path, DEFAULT_MAPPINGS_TOML)
        .map_err(|e| format!("Failed to write example mappings: {}", e))?;
    tlog!("[settings] Installed example mappings at {}", settings.mappings_file);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct MappingsDocument {
    #[serde(default)]
    channel: Vec<ChannelMapping>,
}

/// Parse a mapping document, dropping entries whose field cannot sit
/// inside an 8 byte frame. Later stages rely on this bound.
fn parse_mappings(text: &str) -> Result<Vec<ChannelMapping>, String> {
    let document: MappingsDocument =
        toml::from_str(text).map_err(|e| format!("Failed to parse mappings: {}", e))?;

    let mut mappings = Vec::with_capacity(document.channel.len());
    for mapping in document.channel {
        let field_end = mapping.offset as u16 + mapping.length as u16;
        if !(1..=4).contains(&mapping.length) || field_end > 8 {
            tlog!(
                "[settings] Dropping mapping {} ({}): offset {} length {} does not fit a frame",
                mapping.id,
                mapping.channel_name,
                mapping.offset,
                mapping.length
            );
            continue;
        }
        mappings.push(mapping);
    }
    Ok(mappings)
}

pub fn load_mappings(path: &str) -> Result<Vec<ChannelMapping>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read mappings '{}': {}", path, e))?;
    let mappings = parse_mappings(&content)?;
    tlog!("[settings] Loaded {} channel mappings from {}", mappings.len(), path);
    Ok(mappings)
}
