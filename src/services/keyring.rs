use std::sync::Arc;

use anyhow::{Context, Result};
use oo7::Keyring;

use crate::config::{APP_ID, APP_NAME};

const KEYRING_ATTR_APP: &str = "application";
const KEYRING_ATTR_REF: &str = "key-ref";

pub const COMPLETION_API_KEY: &str = "completion-api-key";
pub const AUTH_REFRESH_TOKEN: &str = "auth-refresh-token";

#[derive(Debug, Clone)]
pub struct KeyringService {
    keyring: Arc<Keyring>,
}

impl KeyringService {
    pub async fn new() -> Result<Self> {
        let keyring = Keyring::new()
            .await
            .context("Failed to initialize keyring")?;
        Ok(Self {
            keyring: Arc::new(keyring),
        })
    }

    pub async fn store(&self, key_ref: &str, secret: &str) -> Result<()> {
        let attributes = attributes(key_ref);
        let attr_refs: Vec<(&str, &str)> =
            attributes.iter().map(|(k, v)| (*k, v.as_str())).collect();

        self.keyring
            .create_item(
                &item_label(key_ref),
                &attr_refs,
                secret,
                true, // replace if exists
            )
            .await
            .context("Failed to store secret in keyring")?;

        tracing::debug!(key_ref, "Secret stored in keyring");
        Ok(())
    }

    pub async fn retrieve(&self, key_ref: &str) -> Result<Option<String>> {
        let attributes = attributes(key_ref);
        let attr_refs: Vec<(&str, &str)> =
            attributes.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let items = self
            .keyring
            .search_items(&attr_refs)
            .await
            .context("Failed to search keyring")?;

        match items.first() {
            Some(item) => {
                let secret = item.secret().await.context("Failed to read secret")?;
                let secret_str =
                    String::from_utf8(secret.to_vec()).context("Secret is not valid UTF-8")?;
                Ok(Some(secret_str))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key_ref: &str) -> Result<()> {
        let attributes = attributes(key_ref);
        let attr_refs: Vec<(&str, &str)> =
            attributes.iter().map(|(k, v)| (*k, v.as_str())).collect();

        self.keyring
            .delete(&attr_refs)
            .await
            .context("Failed to delete secret from keyring")?;

        Ok(())
    }
}

fn item_label(key_ref: &str) -> String {
    format!("{} - {}", APP_NAME, key_ref)
}

fn attributes(key_ref: &str) -> Vec<(&'static str, String)> {
    vec![
        (KEYRING_ATTR_APP, APP_ID.to_string()),
        (KEYRING_ATTR_REF, key_ref.to_string()),
    ]
}
