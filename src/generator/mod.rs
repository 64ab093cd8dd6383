//! Content-generation collaborator
//!
//! The pipeline never generates content itself. Every text, structured and
//! image artifact comes from a [`ContentGenerator`], which is treated as an
//! opaque external service.

pub mod command;
pub mod error;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use command::CommandGenerator;
pub use error::GenerationError;

/// Quality/cost tier requested from the generator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Fast,
    Pro,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Fast => "fast",
            QualityTier::Pro => "pro",
        }
    }
}

/// Aspect ratio for generated images
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[default]
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "16:9")]
    Widescreen,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Landscape => "4:3",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Widescreen => "16:9",
        }
    }
}

/// Trait for content generation - allows for different implementations
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Generate free-form text
    async fn generate_text(&self, prompt: &str, tier: QualityTier)
        -> Result<String, GenerationError>;

    /// Generate a JSON value conforming to `schema`
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        tier: QualityTier,
    ) -> Result<serde_json::Value, GenerationError>;

    /// Generate an image; `None` when the service produced no image
    async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<Option<Vec<u8>>, GenerationError>;
}

/// Generate structured output and deserialize it into `T`
pub async fn generate_typed<T: DeserializeOwned>(
    generator: &dyn ContentGenerator,
    prompt: &str,
    schema: &serde_json::Value,
    tier: QualityTier,
) -> Result<T, GenerationError> {
    let value = generator.generate_structured(prompt, schema, tier).await?;
    serde_json::from_value(value).map_err(|e| GenerationError::Malformed(e.to_string()))
}
