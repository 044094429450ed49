use serde::{Deserialize, Serialize};

// --- Request types ---

#[derive(Serialize)]
pub struct PasswordCredentials<'a> {
    pub email: &'a str,
    pub password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gotrue_meta_security: Option<MetaSecurity<'a>>,
}

#[derive(Serialize)]
pub struct MetaSecurity<'a> {
    pub captcha_token: &'a str,
}

#[derive(Serialize)]
pub struct RefreshTokenGrant<'a> {
    pub refresh_token: &'a str,
}

// --- Response types ---

/// Token grant response. Sign-up returns the same shape when the project
/// auto-confirms emails, or only `user` fields when confirmation is pending.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub expires_at: Option<i64>,
    pub user: Option<AuthUser>,
    // Pending sign-ups put the user fields at the top level.
    pub id: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

// --- Error types ---

#[derive(Debug, Default, Deserialize)]
pub struct AuthErrorResponse {
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    pub msg: Option<String>,
    pub message: Option<String>,
}

impl AuthErrorResponse {
    pub fn text(&self) -> String {
        self.msg
            .as_deref()
            .or(self.error_description.as_deref())
            .or(self.message.as_deref())
            .or(self.error.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}
