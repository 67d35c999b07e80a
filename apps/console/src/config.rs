use std::fs;

use composer_core::default_allowed_actions;
use serde::Deserialize;
use shared::domain::{ActionValue, Channel, MatchId};

#[derive(Debug)]
pub struct Settings {
    pub database_url: String,
    pub base_url: String,
    pub preview_path: String,
    pub live_path: String,
    pub allowed_actions: Vec<ActionValue>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/composer.db".into(),
            base_url: "https://match-score.dflix.com".into(),
            preview_path: "/preview-score/".into(),
            live_path: "/live-score/".into(),
            allowed_actions: default_allowed_actions(),
        }
    }
}

impl Settings {
    /// Display endpoint for one channel of a match.
    pub fn display_url(&self, channel: Channel, match_id: &MatchId) -> String {
        let path = match channel {
            Channel::Preview => &self.preview_path,
            Channel::Live => &self.live_path,
        };
        format!("{}{}{}", self.base_url.trim_end_matches('/'), path, match_id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    database_url: Option<String>,
    base_url: Option<String>,
    preview_path: Option<String>,
    live_path: Option<String>,
    allowed_actions: Option<Vec<ActionValue>>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("composer.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            if let Some(v) = file_cfg.database_url {
                settings.database_url = v;
            }
            if let Some(v) = file_cfg.base_url {
                settings.base_url = v;
            }
            if let Some(v) = file_cfg.preview_path {
                settings.preview_path = v;
            }
            if let Some(v) = file_cfg.live_path {
                settings.live_path = v;
            }
            if let Some(v) = file_cfg.allowed_actions {
                settings.allowed_actions = v;
            }
        }
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("COMPOSER__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("COMPOSER__BASE_URL") {
        settings.base_url = v;
    }

    settings
}
