//! Subprocess content generator - calls an external generator executable

use crate::core::config::GeneratorSettings;
use crate::generator::{AspectRatio, ContentGenerator, GenerationError, QualityTier};
use async_trait::async_trait;
use regex::Regex;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Exit status a generator uses to signal rate limiting (EX_TEMPFAIL)
const EXIT_RATE_LIMITED: i32 = 75;
/// Exit statuses a generator uses to reject a request (EX_USAGE, EX_DATAERR)
const EXIT_INVALID: [i32; 2] = [64, 65];

/// Generator that runs an external executable once per call
///
/// The executable is invoked as
/// `<command> <args..> --mode <text|json|image> [options] <prompt>` and its
/// stdout is the result: text for `text`, a JSON document for `json`, raw
/// image bytes for `image` (empty output means no image).
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    args: Vec<String>,
    timeout_secs: u64,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        let defaults = GeneratorSettings::default();
        Self {
            command: command.into(),
            args: defaults.args,
            timeout_secs: defaults.timeout_secs,
        }
    }

    pub fn from_settings(settings: &GeneratorSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            timeout_secs: settings.timeout_secs,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the executable and return its stdout
    async fn invoke(&self, call_args: &[&str], prompt: &str) -> Result<Vec<u8>, GenerationError> {
        debug!(
            "Spawning generator {} ({}) with prompt length: {}",
            self.command,
            call_args.join(" "),
            prompt.len()
        );

        let result = timeout(
            Duration::from_secs(self.timeout_secs),
            Command::new(&self.command)
                .args(&self.args)
                .args(call_args)
                .arg(prompt)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| GenerationError::Timeout(self.timeout_secs))?;

        let output = result.map_err(|e| {
            GenerationError::Unavailable(format!("Failed to execute {}: {}", self.command, e))
        })?;

        check_status(&self.command, &output)?;
        debug!("Generator returned {} bytes of output", output.stdout.len());
        Ok(output.stdout)
    }
}

fn check_status(command: &str, output: &Output) -> Result<(), GenerationError> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);
    warn!("{} exited with code {}: {}", command, exit_code, stderr.trim());

    let message = format!("{} exited with code {}: {}", command, exit_code, stderr.trim());
    Err(match exit_code {
        EXIT_RATE_LIMITED => GenerationError::RateLimited(message),
        code if EXIT_INVALID.contains(&code) => GenerationError::Invalid(message),
        _ => GenerationError::Unavailable(message),
    })
}

/// Extract the JSON body from output that may be wrapped in a markdown fence
fn strip_code_fence(text: &str) -> &str {
    match Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```") {
        Ok(fence) => fence
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or_else(|| text.trim()),
        Err(_) => text.trim(),
    }
}

fn decode_text(stdout: Vec<u8>) -> Result<String, GenerationError> {
    String::from_utf8(stdout)
        .map_err(|e| GenerationError::Malformed(format!("Failed to decode output: {}", e)))
}

#[async_trait]
impl ContentGenerator for CommandGenerator {
    async fn generate_text(
        &self,
        prompt: &str,
        tier: QualityTier,
    ) -> Result<String, GenerationError> {
        let stdout = self
            .invoke(&["--mode", "text", "--tier", tier.as_str()], prompt)
            .await?;
        decode_text(stdout)
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        tier: QualityTier,
    ) -> Result<serde_json::Value, GenerationError> {
        let schema = schema.to_string();
        let stdout = self
            .invoke(
                &["--mode", "json", "--tier", tier.as_str(), "--schema", &schema],
                prompt,
            )
            .await?;
        let text = decode_text(stdout)?;
        serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| GenerationError::Malformed(format!("Invalid JSON output: {}", e)))
    }

    async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<Option<Vec<u8>>, GenerationError> {
        let stdout = self
            .invoke(
                &["--mode", "image", "--aspect-ratio", aspect_ratio.as_str()],
                prompt,
            )
            .await?;
        Ok(if stdout.is_empty() { None } else { Some(stdout) })
    }
}
