use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::models::*;
use crate::config::CompletionConfig;
use crate::models::Role;
use crate::providers::traits::CompletionService;
use crate::providers::types::{ChatMessage, ChatRequest, ChatResponse, ProviderError};

/// Client for any OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiProvider {
    client: Client,
    config: CompletionConfig,
}

impl OpenAiProvider {
    pub fn new(config: CompletionConfig) -> Result<Self, ProviderError> {
        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| ProviderError::RequestFailed(format!("HTTP client setup: {}", e)))?;
        Ok(Self { client, config })
    }

    fn translate_role(role: &Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_messages(system_prompt: Option<&str>, messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
        let mut result = Vec::with_capacity(messages.len() + 1);

        if let Some(prompt) = system_prompt {
            if !prompt.is_empty() {
                result.push(OpenAiMessage {
                    role: "system".to_string(),
                    content: Some(prompt.to_string()),
                });
            }
        }

        result.extend(messages.iter().map(|msg| OpenAiMessage {
            role: Self::translate_role(&msg.role).to_string(),
            content: Some(msg.content.clone()),
        }));

        result
    }

    fn build_auth_header(api_key: &str) -> Option<String> {
        if api_key.is_empty() {
            None
        } else {
            Some(format!("Bearer {}", api_key))
        }
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.message);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    fn request_for(&self, prompt: &str) -> ChatRequest {
        ChatRequest {
            api_key: self.config.api_key.clone(),
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: prompt.to_string(),
            }],
            base_url: self.config.base_url.clone(),
            temperature: self.config.temperature,
            system_prompt: Some(self.config.system_prompt.clone()),
            max_tokens: self.config.max_tokens,
        }
    }

    pub async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", request.base_url.trim_end_matches('/'));

        let openai_request = OpenAiRequest {
            model: request.model.clone(),
            messages: Self::build_messages(request.system_prompt.as_deref(), &request.messages),
            stream: false,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut req = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&openai_request);

        if let Some(auth) = Self::build_auth_header(&request.api_key) {
            req = req.header("Authorization", auth);
        }

        tracing::debug!(model = %request.model, "Requesting completion");

        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ProviderError::AuthError("Invalid API key".to_string()));
        }

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Self::into_chat_response(openai_response, request.model)
    }

    fn into_chat_response(
        response: OpenAiResponse,
        requested_model: String,
    ) -> Result<ChatResponse, ProviderError> {
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }

        let (tokens_in, tokens_out) = response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));

        Ok(ChatResponse {
            content,
            model: response.model.unwrap_or(requested_model),
            tokens_in,
            tokens_out,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiProvider {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self.send_message(self.request_for(prompt)).await?;
        tracing::debug!(
            model = %response.model,
            tokens_in = ?response.tokens_in,
            tokens_out = ?response.tokens_out,
            "Completion received"
        );
        Ok(response.content)
    }
}
