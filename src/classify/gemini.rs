use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{ClassificationProvider, ClassificationRequest, ProviderError, MAX_CANDIDATES};

pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: BASE_URL.to_string(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Reads the key from `env_var`.
    pub fn from_env(model: impl Into<String>, env_var: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = std::env::var(env_var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingApiKey(env_var.to_string()))?;
        Self::new(model, api_key, timeout)
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    InlineData {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
    Text(String),
}

impl Part {
    fn text(text: &str) -> Self {
        Part::Text(text.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: Value,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Gemini uses an OpenAPI subset with upper case type names.
fn response_schema() -> Value {
    let hint = json!({ "type": "STRING", "enum": ["strong", "medium", "weak"] });
    json!({
        "type": "OBJECT",
        "properties": {
            "matchId": { "type": "STRING", "nullable": true },
            "reason": { "type": "STRING" },
            "confidenceHint": hint,
            "candidates": {
                "type": "ARRAY",
                "maxItems": MAX_CANDIDATES,
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "id": { "type": "STRING" },
                        "confidenceHint": hint
                    },
                    "required": ["id", "confidenceHint"]
                }
            },
            "whyNotSecond": { "type": "STRING" },
            "action": { "type": "STRING", "nullable": true }
        },
        "required": ["reason"]
    })
}

fn extract_text(response: GenerateResponse) -> Result<String, ProviderError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(text)
}

#[async_trait]
impl ClassificationProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ProviderError> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::InlineData {
                        mime_type: request.frame.mime_type.to_string(),
                        data: BASE64_STANDARD.encode(&request.frame.data),
                    },
                    Part::text(&request.prompt),
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                response_schema: response_schema(),
            },
        };

        debug!("Sending {} byte frame to {}", request.frame.data.len(), self.model);
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::InlineData {
                        mime_type: "image/png".into(),
                        data: BASE64_STANDARD.encode([1u8, 2, 3]),
                    },
                    Part::text("prompt"),
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                response_schema: response_schema(),
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        let parts = &value["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[0]["inlineData"]["data"], "AQID");
        assert_eq!(parts[1]["text"], "prompt");
        assert_eq!(
            value["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(value["generationConfig"]["responseSchema"]["type"], "OBJECT");
    }

    #[test]
    fn test_text_is_joined_from_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{ "candidates": [{ "content": { "parts": [{ "text": "{\"reason\":" }, { "text": "\"x\"}" }] } }] }"#,
        )
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), r#"{"reason":"x"}"#);
    }

    #[test]
    fn test_empty_response() {
        let response: GenerateResponse = serde_json::from_str(r#"{ "candidates": [] }"#).unwrap();
        assert!(matches!(
            extract_text(response),
            Err(ProviderError::EmptyResponse)
        ));
        let response: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(extract_text(response).is_err());
    }

    #[test]
    fn test_missing_key() {
        let result = GeminiProvider::from_env(
            DEFAULT_MODEL,
            "TRACKWHAT_TEST_KEY_THAT_IS_NOT_SET",
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ProviderError::MissingApiKey(_))));
    }
}
