//! Scripted collaborators for driving the orchestration service in tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image_forge::generation::{
    CharacterDescriber, GenerationError, GenerationRequest, ImageGenerator, ImageInput,
    PromptAssistant, SplitOutcome,
};
use image_forge::storage::MemoryBlobStore;
use image_forge::tasks::{Task, TaskId};
use image_forge::{Collaborators, ForgeConfig, OrchestrationService};
use secrecy::{ExposeSecret, SecretString};

pub const KEY_A: &str = "key-aaaaaaaa";
pub const KEY_B: &str = "key-bbbbbbbb";
pub const SUFFIX_A: &str = "aaaaaaaa";
pub const SUFFIX_B: &str = "bbbbbbbb";

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// PNG-tagged bytes unique to the prompt.
pub fn image_for(prompt: &str) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.extend_from_slice(prompt.as_bytes());
    bytes
}

/// One observed generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub prompt: String,
    pub key: String,
    pub had_previous_image: bool,
}

/// Generator whose behaviour is keyed off the prompt text:
/// `quota` exhausts the key once, `reject` is refused, `slow` waits.
#[derive(Default)]
pub struct ScriptedGenerator {
    calls: Mutex<Vec<Call>>,
    exhausted_once: Mutex<Vec<String>>,
    pub delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.prompt).collect()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        api_key: &SecretString,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, GenerationError> {
        let key = api_key.expose_secret().to_string();
        self.calls.lock().expect("calls lock").push(Call {
            prompt: request.prompt.clone(),
            key: key.clone(),
            had_previous_image: request.previous_image.is_some(),
        });

        if request.prompt.contains("slow") {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
        if request.prompt.contains("reject") {
            return Err(GenerationError::refused("the model declined this prompt"));
        }
        if request.prompt.contains("quota") {
            let mut exhausted = self.exhausted_once.lock().expect("exhausted lock");
            if !exhausted.contains(&request.prompt) {
                exhausted.push(request.prompt.clone());
                return Err(GenerationError::new("RESOURCE_EXHAUSTED", "quota exceeded").with_status(429));
            }
        }
        Ok(image_for(&request.prompt))
    }
}

pub struct FixedDescriber(pub String);

#[async_trait]
impl CharacterDescriber for FixedDescriber {
    async fn describe(
        &self,
        _api_key: &SecretString,
        _image: &ImageInput,
    ) -> Result<String, GenerationError> {
        Ok(self.0.clone())
    }
}

pub struct EchoAssistant;

#[async_trait]
impl PromptAssistant for EchoAssistant {
    async fn split_prompts(
        &self,
        _api_key: &SecretString,
        text: &str,
    ) -> Result<SplitOutcome, GenerationError> {
        let prompts: Vec<String> = text
            .split(';')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Ok(SplitOutcome {
            summary: format!("assistant found {}", prompts.len()),
            prompts,
        })
    }
}

pub fn test_config() -> ForgeConfig {
    ForgeConfig::default()
        .with_job_interval(Duration::ZERO)
        .with_idle_poll_interval(Duration::from_millis(10))
}

pub struct Harness {
    pub service: OrchestrationService,
    pub generator: Arc<ScriptedGenerator>,
    pub blobs: Arc<MemoryBlobStore>,
}

pub fn harness_with(config: ForgeConfig, generator: ScriptedGenerator, keys: &[&str]) -> Harness {
    let generator = Arc::new(generator);
    let blobs = Arc::new(MemoryBlobStore::new());
    let collaborators = Collaborators {
        generator: generator.clone(),
        describer: Arc::new(FixedDescriber("a tall knight in silver armour".to_string())),
        assistant: Arc::new(EchoAssistant),
        blobs: blobs.clone(),
    };
    let service = OrchestrationService::new(config, collaborators).expect("should build service");
    for key in keys {
        service
            .add_credential(SecretString::from(key.to_string()))
            .expect("should add credential");
    }
    Harness {
        service,
        generator,
        blobs,
    }
}

pub fn harness(keys: &[&str]) -> Harness {
    harness_with(test_config(), ScriptedGenerator::default(), keys)
}

/// Polls until the Task reaches a terminal status.
pub async fn wait_terminal(service: &OrchestrationService, id: TaskId) -> Task {
    for _ in 0..500 {
        let task = service.get_task(id).expect("task should exist");
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} did not finish in time", id);
}

/// Polls until `check` holds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
