//! Capability traits for the external generative service.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::error::GenerationError;
use super::image::ImageInput;

/// One image generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Reference image supplied with the Task.
    pub reference_image: Option<ImageInput>,
    /// Character description folded into the prompt.
    pub context_text: Option<String>,
    /// Most recent successful artifact of the same Task (character sync only).
    pub previous_image: Option<ImageInput>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_reference_image(mut self, image: Option<ImageInput>) -> Self {
        self.reference_image = image;
        self
    }

    pub fn with_context_text(mut self, text: Option<String>) -> Self {
        self.context_text = text;
        self
    }

    pub fn with_previous_image(mut self, image: Option<ImageInput>) -> Self {
        self.previous_image = image;
        self
    }
}

/// Prompts extracted from free text plus a one-line summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOutcome {
    pub prompts: Vec<String>,
    pub summary: String,
}

/// Produces image bytes from a prompt.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        api_key: &SecretString,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, GenerationError>;
}

/// Extracts a reusable character description from an image.
#[async_trait]
pub trait CharacterDescriber: Send + Sync {
    async fn describe(
        &self,
        api_key: &SecretString,
        image: &ImageInput,
    ) -> Result<String, GenerationError>;
}

/// Splits free text into individual image prompts with model assistance.
#[async_trait]
pub trait PromptAssistant: Send + Sync {
    async fn split_prompts(
        &self,
        api_key: &SecretString,
        text: &str,
    ) -> Result<SplitOutcome, GenerationError>;
}
