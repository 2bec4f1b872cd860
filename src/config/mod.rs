use config::ConfigError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// Server network settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkSettings {
    pub bind_address: String,
    pub port: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebSocketSettings {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            client_timeout_secs: 60,
            max_connections: 100,
        }
    }
}

// Ensemble session settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionSettings {
    pub ensemble_name: String,
    /// Maximum delay to clients, in seconds; timeline changes must land at
    /// least this far in the future.
    pub max_net_delay: f64,
    pub admin_password_path: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ensemble_name: "gdc".to_string(),
            max_net_delay: 2.4,
            admin_password_path: "resources/admin_password.txt".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GridSettings {
    pub dimension: i32,
    pub bijection_value: i64,
    pub spiral_max_radius: i32,
    pub relaxation_iterations: u32,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            dimension: 16,
            bijection_value: 10_000,
            spiral_max_radius: 40,
            relaxation_iterations: 2000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecorderSettings {
    pub log_dir: String,
    pub buffer_lines: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            buffer_lines: 100_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MidiSettings {
    pub script_path: String,
    pub output_dir: String,
    pub web_root: String,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            script_path: "python/generatemidis.py".to_string(),
            output_dir: "web/midifiles".to_string(),
            web_root: "web".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogSettings {
    pub console_level: String,
    pub file_level: String,
    pub file_path: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file_level: "debug".to_string(),
            file_path: "drumgrid.log".to_string(),
        }
    }
}

// Main settings struct
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub websocket: WebSocketSettings,
    pub session: SessionSettings,
    pub grid: GridSettings,
    pub recorder: RecorderSettings,
    pub midi: MidiSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Loads the YAML settings file named by `SETTINGS_FILE_PATH` (default
    /// `settings.yaml`), falling back to defaults when no file exists, then
    /// applies environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        debug!("Initializing settings");

        let settings_path = std::env::var("SETTINGS_FILE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("settings.yaml"));

        let mut settings = if settings_path.exists() {
            debug!("Loading settings from: {:?}", settings_path);
            let yaml_content = std::fs::read_to_string(&settings_path).map_err(|e| {
                ConfigError::NotFound(format!("Failed to read settings file: {}", e))
            })?;
            serde_yaml::from_str(&yaml_content)
                .map_err(|e| ConfigError::Message(format!("Failed to parse YAML: {}", e)))?
        } else {
            debug!("No settings file at {:?}; using defaults", settings_path);
            Settings::default()
        };

        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("DRUMGRID_BIND_ADDRESS") {
            self.network.bind_address = bind;
        }
        if let Ok(port) = std::env::var("DRUMGRID_PORT") {
            if let Ok(port) = port.parse() {
                self.network.port = port;
            }
        }
        if let Ok(path) = std::env::var("DRUMGRID_ADMIN_PASSWORD_FILE") {
            self.session.admin_password_path = path;
        }
    }
}
