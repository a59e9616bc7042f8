//! Image-generation capability and handling of generated image bytes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::ImageFormat;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage>;
}

/// Decode the bytes to make sure they are a real image.
pub fn validate_image(bytes: Vec<u8>) -> Result<GeneratedImage> {
    let format = image::guess_format(&bytes).context("Unrecognised image format")?;
    let decoded = image::load_from_memory_with_format(&bytes, format)
        .context("Generated image failed to decode")?;
    Ok(GeneratedImage {
        width: decoded.width(),
        height: decoded.height(),
        format,
        bytes,
    })
}

/// Write a scene image as `<conversation>_<version>.<ext>` under `dir`.
pub fn save_scene_image(
    dir: &Path,
    conversation_id: &str,
    scene_version: u64,
    image: &GeneratedImage,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create image directory {:?}", dir))?;
    let extension = image
        .format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("img");
    let safe_id: String = conversation_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{}_{}.{}", safe_id, scene_version, extension));
    std::fs::write(&path, &image.bytes)
        .with_context(|| format!("Failed to write image to {:?}", path))?;
    Ok(path)
}
