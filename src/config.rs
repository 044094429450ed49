use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use url::Url;

use crate::services::database::Database;

pub const APP_ID: &str = "org.biochat.BioChat";
pub const APP_NAME: &str = "BioChat";

pub const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com";
pub const DEFAULT_COMPLETION_MODEL: &str = "gpt-4o-mini";

/// Persona sent as the system prompt with every completion request.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Você é o BioChat, um educador especialista em \
biodiversidade brasileira e mundial. Responda em português, com linguagem clara e \
acessível, explicando espécies, ecossistemas e conservação. Quando o usuário enviar \
descrições de arquivos, use as informações fornecidas para orientar a análise.";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub auth: AuthConfig,
    pub completion: CompletionConfig,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub base_url: String,
    pub anon_key: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("base_url", &self.base_url)
            .field("anon_key", &"***")
            .finish()
    }
}

#[derive(Clone)]
pub struct CompletionConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// No timeout beyond the transport default when unset.
    pub timeout_secs: Option<u64>,
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. The completion API
    /// key may be left empty here and filled from the keyring later.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let db_path = match get("BIOCHAT_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => Database::default_path()?,
        };

        let auth_url = get("BIOCHAT_AUTH_URL").context("BIOCHAT_AUTH_URL is not set")?;
        let anon_key = get("BIOCHAT_AUTH_ANON_KEY").context("BIOCHAT_AUTH_ANON_KEY is not set")?;

        let completion_url =
            get("BIOCHAT_COMPLETION_URL").unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string());

        let timeout_secs = get("BIOCHAT_COMPLETION_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("Invalid BIOCHAT_COMPLETION_TIMEOUT_SECS: {}", v))
            })
            .transpose()?;

        Ok(Self {
            db_path,
            auth: AuthConfig {
                base_url: validate_url("BIOCHAT_AUTH_URL", &auth_url)?,
                anon_key,
            },
            completion: CompletionConfig {
                base_url: validate_url("BIOCHAT_COMPLETION_URL", &completion_url)?,
                api_key: get("BIOCHAT_COMPLETION_API_KEY").unwrap_or_default(),
                model: get("BIOCHAT_COMPLETION_MODEL")
                    .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                temperature: None,
                max_tokens: None,
                timeout_secs,
            },
        })
    }
}

fn validate_url(key: &str, value: &str) -> Result<String> {
    let url = Url::parse(value).with_context(|| format!("{} is not a valid URL: {}", key, value))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{} must use http or https: {}", key, value);
    }
    Ok(value.trim_end_matches('/').to_string())
}
