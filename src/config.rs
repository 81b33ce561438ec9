use serde::{Deserialize, Serialize};

use crate::store::TimeTrackingMode;

pub const APP_NAME: &str = "nwlog";

fn default_parse_immunity() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory the game writes its client logs into.
    pub log_directory: String,
    /// When set, damage from other characters is flagged so displays can
    /// focus on this player.
    #[serde(default)]
    pub player_name: Option<String>,
    /// Damage immunity lines are only logged by some servers; parsing them
    /// can be switched off.
    #[serde(default = "default_parse_immunity")]
    pub parse_immunity: bool,
    #[serde(default)]
    pub time_tracking_mode: TimeTrackingMode,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_directory: "logs".to_string(),
            player_name: None,
            parse_immunity: true,
            time_tracking_mode: TimeTrackingMode::PerCharacter,
        }
    }
}

impl AppConfig {
    /// Loads the YAML config, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load() -> Self {
        match confy::load(APP_NAME, None) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(error = %error, "failed to load config, using defaults");
                AppConfig::default()
            }
        }
    }

    pub fn save(&self) {
        if let Err(error) = confy::store(APP_NAME, None, self) {
            tracing::warn!(error = %error, "failed to persist config");
        }
    }
}
