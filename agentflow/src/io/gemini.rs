//! Gemini `generateContent` backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::io::generator::{BackendError, GenerationError, GenerationRequest, Generator};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: RequestConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// Calls `POST {base_url}/models/{model}:generateContent?key={api_key}`.
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiGenerator {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    #[instrument(skip_all, fields(label = %request.label, model = %self.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let body = GenerateRequest {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![RequestPart {
                    text: &request.prompt,
                }],
            }],
            generation_config: RequestConfig {
                temperature: request.temperature,
                response_mime_type: request.expect_json.then_some("application/json"),
            },
        };

        debug!(
            prompt_len = request.prompt.len(),
            expect_json = request.expect_json,
            "calling gemini"
        );
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());
            error!(status = status.as_u16(), body = %body, "gemini returned error status");
            if status.as_u16() == 429 {
                return Err(GenerationError::RateLimited { body });
            }
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let raw = response
            .text()
            .await
            .map_err(|e| GenerationError::Transport(e.without_url().to_string()))?;
        let text = extract_text(&raw)?;
        debug!(response_len = text.len(), "gemini response received");
        Ok(text)
    }
}

fn extract_text(raw: &str) -> Result<String, GenerationError> {
    let parsed: GenerateResponse =
        serde_json::from_str(raw).map_err(|e| GenerationError::Malformed(e.to_string()))?;

    if let Some(reason) = parsed
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_ref())
    {
        return Err(GenerationError::Blocked(reason.clone()));
    }

    let candidate = parsed
        .candidates
        .first()
        .ok_or_else(|| GenerationError::Empty("no candidates".to_string()))?;
    let text: String = candidate
        .content
        .iter()
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect();
    if text.trim().is_empty() {
        return Err(GenerationError::Empty("candidate has no text".to_string()));
    }
    Ok(text)
}
