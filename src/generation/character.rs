//! Prompt text for character-consistent generation.

/// Instruction sent with a reference image to obtain a reusable description.
pub const CHARACTER_ANALYSIS_PROMPT: &str = "\
Describe the FIXED traits of the main character and the overall colour scheme of this image \
so that another model can redraw the character faithfully. Cover, in order:
1. Character colours: hair, eyes, skin, each garment, accessories.
2. Overall palette: dominant tone, main colours, background, lighting and shadows, contrast, saturation.
3. Build and style: hairstyle, clothing style, fashion style.
4. Art style: medium (anime, realistic, cartoon, ...), level of detail, rendering technique.
5. Identifying details: distinctive accessories, garment patterns, logos.
Do NOT describe actions, temporary expressions or the specific situation.
Answer with a structured, detailed description only.";

/// Folds a character description into a prompt.
pub fn enhance_prompt(prompt: &str, character: Option<&str>) -> String {
    match character.map(str::trim).filter(|c| !c.is_empty()) {
        Some(traits) => format!(
            "{}, with a character that has these traits: {}, using the same colour palette and lighting as the reference image",
            prompt, traits
        ),
        None => prompt.to_string(),
    }
}

/// Final instruction text for an image generation call.
pub fn generation_instruction(prompt: &str, has_image_context: bool) -> String {
    if has_image_context {
        format!(
            "Generate a new image based on this reference image. Description: {}",
            prompt
        )
    } else {
        format!(
            "Create a beautiful image of: {}. Make it realistic and detailed.",
            prompt
        )
    }
}
