//! External generative capabilities: image generation, character analysis and
//! prompt splitting, plus the Gemini HTTP implementation of all three.

mod character;
mod error;
mod gemini;
mod image;
mod splitter;
mod types;

pub use character::{enhance_prompt, generation_instruction, CHARACTER_ANALYSIS_PROMPT};
pub use error::{ErrorClass, GenerationError};
pub use gemini::GeminiClient;
pub use image::{ImageFormat, ImageInput};
pub use splitter::pattern_split;
pub use types::{
    CharacterDescriber, GenerationRequest, ImageGenerator, PromptAssistant, SplitOutcome,
};
