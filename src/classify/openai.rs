use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{response_schema, ClassificationProvider, ClassificationRequest, ProviderError};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const BASE_URL: &str = "https://api.openai.com/v1";

/// Chat completions back end. Works with any server exposing the same API.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_env(
        model: impl Into<String>,
        env_var: &str,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = std::env::var(env_var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingApiKey(env_var.to_string()))?;
        Self::new(model, api_key, base_url, timeout)
    }

    fn body(&self, request: &ClassificationRequest) -> ChatRequest {
        let image_url = format!(
            "data:{};base64,{}",
            request.frame.mime_type,
            BASE64_STANDARD.encode(&request.frame.data)
        );
        ChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: request.prompt.clone(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url },
                    },
                ],
            }],
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "activity_classification",
                    "schema": response_schema(),
                }
            }),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    response_format: Value,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn extract_text(response: ChatResponse) -> Result<String, ProviderError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or(ProviderError::EmptyResponse)
}

#[async_trait]
impl ClassificationProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ProviderError> {
        debug!("Sending {} byte frame to {}", request.frame.data.len(), self.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        extract_text(response.json().await?)
    }
}
