//! AI vision triage capability.
//!
//! Concrete provider SDKs live outside the engine. The engine owns the
//! capability trait, the payload preparation (downscale + base64) every
//! implementation needs, and the parsing of the model's JSON back into
//! typed triage signals.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::AbortSignal;
use crate::config::AiConfig;
use crate::error::{Result, VrtError};
use crate::image_ops;
use crate::score::{AiRecommendation, AiSignals, ChangeCategory, Severity};

/// Images beyond this side length are downscaled before encoding; vision
/// models reject larger payloads.
const MAX_VISION_DIM: u32 = 7500;

#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub baseline_path: PathBuf,
    pub test_path: PathBuf,
    pub diff_path: Option<PathBuf>,
    pub prompt: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct VisionResponse {
    /// Raw model text; the scorer extracts the JSON block.
    pub text: String,
    pub tokens_used: Option<u64>,
}

/// Capability implemented by deployment-specific vision backends
/// (OpenAI-, Anthropic-, Google- or OpenRouter-compatible).
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn analyze(&self, request: &VisionRequest) -> Result<VisionResponse>;
}

/// Parsed triage result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiAnalysis {
    pub category: ChangeCategory,
    pub severity: Severity,
    pub confidence: f64,
    pub recommendation: AiRecommendation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

impl AiAnalysis {
    pub fn signals(&self) -> AiSignals {
        AiSignals {
            confidence: self.confidence,
            recommendation: self.recommendation,
            category: Some(self.category),
        }
    }
}

/// Load an image and return it as a base64 PNG payload, bilinearly
/// downscaled when either side exceeds the provider limit.
pub fn prepare_image_payload(path: &Path) -> Result<String> {
    let img = image_ops::decode_png(path)?;
    let img = image_ops::downscale_to_fit(&img, MAX_VISION_DIM);
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
        .map_err(|e| VrtError::Vision(format!("payload encode failed: {e}")))?;
    Ok(BASE64.encode(bytes))
}

/// The triage prompt sent with every pair. Instructs the model to answer
/// with a single JSON object the parser below understands.
pub fn build_triage_prompt(scenario: &str, diff_percent: f64) -> String {
    format!(
        "You are reviewing a visual regression for scenario \"{scenario}\". \
The first image is the approved baseline, the second the new capture{}. \
{diff_percent:.3}% of pixels differ. Classify the change and respond with \
exactly one JSON object: {{\"category\": \
\"cosmetic|noise|content_change|layout_shift|regression\", \"severity\": \
\"info|warning|critical\", \"confidence\": 0.0-1.0, \"recommendation\": \
\"approve|review|reject\", \"summary\": \"one sentence\"}}",
        ", the third the highlighted diff"
    )
}

/// Locate the outermost `{...}` block in model output, tolerating fenced
/// and prose-wrapped JSON.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse raw model text into a typed analysis. Unknown enum values are
/// rejected rather than guessed at.
pub fn parse_analysis(response: &VisionResponse) -> Result<AiAnalysis> {
    let block = extract_json_block(&response.text)
        .ok_or_else(|| VrtError::Vision("no JSON object in model output".to_string()))?;
    let mut analysis: AiAnalysis = serde_json::from_str(block)
        .map_err(|e| VrtError::Vision(format!("unparsable analysis: {e}")))?;
    analysis.confidence = analysis.confidence.clamp(0.0, 1.0);
    analysis.tokens_used = response.tokens_used;
    Ok(analysis)
}

/// Run one triage pass with the configured timeout, racing abortion.
/// Failures are logged and swallowed; AI is advisory.
pub async fn triage_pair(
    provider: &dyn VisionProvider,
    config: &AiConfig,
    scenario: &str,
    baseline_path: &Path,
    test_path: &Path,
    diff_path: Option<&Path>,
    diff_percent: f64,
    abort: &AbortSignal,
) -> Option<AiAnalysis> {
    let request = VisionRequest {
        baseline_path: baseline_path.to_path_buf(),
        test_path: test_path.to_path_buf(),
        diff_path: diff_path.map(Path::to_path_buf),
        prompt: build_triage_prompt(scenario, diff_percent),
        model: config.model.clone(),
    };

    let timeout = Duration::from_millis(config.timeout_ms);
    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, provider.analyze(&request)) => result,
        _ = abort.cancelled() => return None,
    };

    match outcome {
        Ok(Ok(response)) => match parse_analysis(&response) {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                warn!("discarding AI triage for {scenario}: {e}");
                None
            }
        },
        Ok(Err(e)) => {
            warn!("AI triage failed for {scenario}: {e}");
            None
        }
        Err(_) => {
            warn!("AI triage timed out for {scenario} after {timeout:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let text = "Here is my verdict:\n```json\n{\"a\": 1}\n```\nThanks!";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_outermost_block() {
        let text = "prefix {\"outer\": {\"inner\": 2}} suffix";
        assert_eq!(extract_json_block(text), Some("{\"outer\": {\"inner\": 2}}"));
    }

    #[test]
    fn no_block_is_none() {
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block("} backwards {"), None);
    }

    #[test]
    fn parses_prose_wrapped_analysis() {
        let response = VisionResponse {
            text: "Sure! {\"category\": \"cosmetic\", \"severity\": \"info\", \
                   \"confidence\": 0.92, \"recommendation\": \"approve\", \
                   \"summary\": \"Button shadow softened\"}"
                .to_string(),
            tokens_used: Some(311),
        };
        let analysis = parse_analysis(&response).unwrap();
        assert_eq!(analysis.category, ChangeCategory::Cosmetic);
        assert_eq!(analysis.severity, Severity::Info);
        assert_eq!(analysis.recommendation, AiRecommendation::Approve);
        assert_eq!(analysis.tokens_used, Some(311));
    }

    #[test]
    fn confidence_is_clamped() {
        let response = VisionResponse {
            text: "{\"category\": \"noise\", \"severity\": \"info\", \
                   \"confidence\": 7.5, \"recommendation\": \"approve\"}"
                .to_string(),
            tokens_used: None,
        };
        let analysis = parse_analysis(&response).unwrap();
        assert_eq!(analysis.confidence, 1.0);
    }

    #[test]
    fn unknown_category_rejected() {
        let response = VisionResponse {
            text: "{\"category\": \"sparkles\", \"severity\": \"info\", \
                   \"confidence\": 0.5, \"recommendation\": \"approve\"}"
                .to_string(),
            tokens_used: None,
        };
        assert!(parse_analysis(&response).is_err());
    }

    #[test]
    fn payload_downscales_large_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        image::RgbaImage::from_pixel(200, 100, image::Rgba([9, 9, 9, 255]))
            .save(&path)
            .unwrap();
        let payload = prepare_image_payload(&path).unwrap();
        assert!(!payload.is_empty());
        // Round-trips through base64 back to a decodable PNG.
        let bytes = BASE64.decode(payload).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.to_rgba8().dimensions(), (200, 100));
    }
}
