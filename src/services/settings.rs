use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::auth_guard::CaptchaPolicy;
use super::database::Database;
use crate::config::CompletionConfig;

const SETTINGS_KEY: &str = "app_settings";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub captcha_policy: CaptchaPolicy,
    /// Overrides the built-in persona when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl AppSettings {
    pub fn apply_to(&self, completion: &mut CompletionConfig) {
        if let Some(prompt) = self.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            completion.system_prompt = prompt.to_string();
        }
        if self.temperature.is_some() {
            completion.temperature = self.temperature;
        }
    }
}

pub struct SettingsService;

impl SettingsService {
    pub async fn load(db: &Database) -> AppSettings {
        match db.get_setting(SETTINGS_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable settings: {}", e);
                AppSettings::default()
            }),
            Ok(None) => AppSettings::default(),
            Err(e) => {
                tracing::warn!("Failed to load settings: {:#}", e);
                AppSettings::default()
            }
        }
    }

    pub async fn save(db: &Database, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        db.set_setting(SETTINGS_KEY, &json).await
    }
}
