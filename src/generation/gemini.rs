//! Gemini `generateContent` client implementing the generation capabilities.
//!
//! One client serves every credential: the API key travels per request in the
//! `x-goog-api-key` header and is never stored or logged here.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::character::{enhance_prompt, generation_instruction, CHARACTER_ANALYSIS_PROMPT};
use super::error::GenerationError;
use super::image::ImageInput;
use super::types::{
    CharacterDescriber, GenerationRequest, ImageGenerator, PromptAssistant, SplitOutcome,
};
use crate::config::ForgeConfig;
use crate::utils::json_extraction::extract_json_object;

/// Words in a text-only reply that mean the model declined the prompt.
const REFUSAL_MARKERS: &[&str] = &["cannot", "can't", "not supported", "unable", "error"];

/// HTTP client for the generative language API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    image_model: String,
    text_model: String,
}

impl GeminiClient {
    /// Builds a client from the service section of the configuration.
    pub fn new(config: &ForgeConfig) -> Result<Self, GenerationError> {
        Self::with_endpoint(
            config.api_base_url.clone(),
            config.model.clone(),
            config.text_model.clone(),
            config.request_timeout,
        )
    }

    /// Builds a client against a custom endpoint, e.g. a proxy.
    pub fn with_endpoint(
        base_url: impl Into<String>,
        image_model: impl Into<String>,
        text_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::new("CLIENT_INIT", e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            image_model: image_model.into(),
            text_model: text_model.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn image_model(&self) -> &str {
        &self.image_model
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    /// Executes a single request (no retry: the dispatcher owns retry policy).
    async fn generate_content(
        &self,
        api_key: &SecretString,
        model: &str,
        request: &ApiRequest,
    ) -> Result<ApiResponse, GenerationError> {
        let started = Instant::now();
        let http_response = self
            .client
            .post(self.endpoint(model))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::new("TIMEOUT", e.to_string())
                } else {
                    GenerationError::network(e.to_string())
                }
            })?;

        let status = http_response.status();
        tracing::debug!(
            model = model,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Gemini request finished"
        );

        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(parse_error_body(status_code, &error_text));
        }

        http_response
            .json::<ApiResponse>()
            .await
            .map_err(|e| GenerationError::new("INVALID_RESPONSE", format!("Failed to parse API response: {}", e)))
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate(
        &self,
        api_key: &SecretString,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, GenerationError> {
        let prompt = enhance_prompt(&request.prompt, request.context_text.as_deref());
        let has_image_context = request.reference_image.is_some() || request.previous_image.is_some();

        let mut parts = vec![Part::text(generation_instruction(&prompt, has_image_context))];
        for image in [&request.reference_image, &request.previous_image]
            .into_iter()
            .flatten()
        {
            parts.push(Part::image(image));
        }

        let body = ApiRequest {
            contents: vec![Content { parts }],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
            }),
        };

        let response = self.generate_content(api_key, &self.image_model, &body).await?;
        extract_image(response)
    }
}

#[async_trait]
impl CharacterDescriber for GeminiClient {
    async fn describe(
        &self,
        api_key: &SecretString,
        image: &ImageInput,
    ) -> Result<String, GenerationError> {
        let body = ApiRequest {
            contents: vec![Content {
                parts: vec![Part::text(CHARACTER_ANALYSIS_PROMPT), Part::image(image)],
            }],
            generation_config: None,
        };

        let response = self.generate_content(api_key, &self.text_model, &body).await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(GenerationError::new(
                "EMPTY_RESPONSE",
                "Character analysis returned no text",
            ));
        }
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl PromptAssistant for GeminiClient {
    async fn split_prompts(
        &self,
        api_key: &SecretString,
        text: &str,
    ) -> Result<SplitOutcome, GenerationError> {
        let body = ApiRequest {
            contents: vec![Content {
                parts: vec![Part::text(split_instruction(text))],
            }],
            generation_config: None,
        };

        let response = self.generate_content(api_key, &self.text_model, &body).await?;
        parse_split_reply(&response.text())
    }
}

fn split_instruction(text: &str) -> String {
    format!(
        r#"You split text into separate image generation requests.
Extract only the concrete image requests actually present in the text below. Do not invent examples.
If the text holds one idea, return one prompt; if it holds several distinct ideas, return one prompt per idea.

TEXT:
"{}"

Reply with JSON only:
{{"prompts": ["request 1", "request 2"], "count": 2, "analysis": "found 2 image requests"}}"#,
        text
    )
}

#[derive(Debug, Deserialize)]
struct SplitReply {
    #[serde(default)]
    prompts: Vec<String>,
    #[serde(default)]
    analysis: Option<String>,
}

fn parse_split_reply(reply: &str) -> Result<SplitOutcome, GenerationError> {
    let json = extract_json_object(reply)
        .map_err(|e| GenerationError::new("INVALID_RESPONSE", e.to_string()))?;
    let parsed: SplitReply = serde_json::from_str(&json)
        .map_err(|e| GenerationError::new("INVALID_RESPONSE", e.to_string()))?;

    let prompts: Vec<String> = parsed
        .prompts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if prompts.is_empty() {
        return Err(GenerationError::new(
            "INVALID_RESPONSE",
            "Assistant returned no prompts",
        ));
    }

    let summary = parsed
        .analysis
        .unwrap_or_else(|| format!("Found {} prompt(s)", prompts.len()));
    Ok(SplitOutcome { prompts, summary })
}

fn extract_image(response: ApiResponse) -> Result<Vec<u8>, GenerationError> {
    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.clone())
    {
        return Err(GenerationError::refused(format!("Prompt blocked: {}", reason)));
    }

    let mut text = String::new();
    for candidate in &response.candidates {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            if matches!(reason, "SAFETY" | "PROHIBITED_CONTENT" | "IMAGE_SAFETY" | "BLOCKLIST") {
                return Err(GenerationError::refused(format!("Generation stopped: {}", reason)));
            }
        }
        for part in candidate.parts() {
            if let Some(data) = &part.inline_data {
                return BASE64
                    .decode(data.data.as_bytes())
                    .map_err(|e| GenerationError::new("INVALID_RESPONSE", e.to_string()));
            }
            if let Some(t) = &part.text {
                text.push_str(t);
            }
        }
    }

    let lowered = text.to_lowercase();
    if REFUSAL_MARKERS.iter().any(|m| lowered.contains(m)) {
        Err(GenerationError::refused(text))
    } else {
        Err(GenerationError::no_image(if text.is_empty() {
            "Response contained no image".to_string()
        } else {
            text
        }))
    }
}

fn parse_error_body(status_code: u16, body: &str) -> GenerationError {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(parsed) => {
            let reason = parsed
                .error
                .details
                .iter()
                .find_map(|d| d.reason.clone());
            let code = reason
                .or(parsed.error.status)
                .unwrap_or_else(|| "HTTP_ERROR".to_string());
            GenerationError::new(code, parsed.error.message).with_status(status_code)
        }
        Err(_) => GenerationError::new("HTTP_ERROR", body.to_string()).with_status(status_code),
    }
}

/// Internal request structure for `generateContent`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    fn image(image: &ImageInput) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: image.mime_type().to_string(),
                data: BASE64.encode(&image.bytes),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
}

/// Internal response structure from `generateContent`.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

impl ApiResponse {
    /// Concatenated text of every part of every candidate.
    fn text(&self) -> String {
        self.candidates
            .iter()
            .flat_map(|c| c.parts())
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl Candidate {
    fn parts(&self) -> &[Part] {
        self.content.as_ref().map(|c| c.parts.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<ApiErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorInfo {
    #[serde(default)]
    reason: Option<String>,
}
