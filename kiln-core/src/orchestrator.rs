use std::{sync::Arc, time::Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    center_crop, EncodedImage, Error, GenerationRequest, JpegEncoder, ModelManager, Result,
    ServiceState, DEFAULT_QUALITY, PORTRAIT_2_3,
};

/// Denoising steps per image. Fixed: latency over quality.
pub const SYNTHESIS_STEPS: usize = 2;

const PROMPT_PREVIEW_CHARS: usize = 50;

/// Where a request is in the pipeline; failures record the phase they
/// happened in.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RequestPhase {
    Received,
    Validated,
    Synthesizing,
    PostProcessing,
    Encoding,
}

serde_plain::derive_display_from_serialize!(RequestPhase);

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub prompt: String,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn validate(self) -> Result<ValidatedRequest> {
        if self.prompt.trim().is_empty() {
            return Err(Error::invalid_argument("prompt must not be empty"));
        }
        let seed = self
            .seed
            .map(|seed| {
                seed.as_u64().ok_or_else(|| {
                    Error::invalid_argument(format!("seed must be a non-negative integer, got {seed}"))
                })
            })
            .transpose()?;
        Ok(ValidatedRequest {
            prompt: self.prompt,
            seed,
        })
    }
}

/// Turns a request into JPEG bytes: validate, synthesize, crop, encode.
pub struct Orchestrator {
    models: Arc<ModelManager>,
    encoder: JpegEncoder,
    quality: u8,
    aspect_ratio: f64,
}

impl Orchestrator {
    pub fn new(models: Arc<ModelManager>, encoder: JpegEncoder) -> Self {
        Self {
            models,
            encoder,
            quality: DEFAULT_QUALITY,
            aspect_ratio: PORTRAIT_2_3,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<EncodedImage> {
        let started = Instant::now();
        let mut phase = RequestPhase::Received;
        let result = self.run(request, &mut phase, started).await;
        if let Err(e) = &result {
            if e.is_client_error() {
                debug!(%phase, "rejected generation request: {e}");
            } else {
                warn!(%phase, total_ms = started.elapsed().as_millis() as u64, "generation failed: {e}");
            }
        }
        result
    }

    async fn run(
        &self,
        request: GenerationRequest,
        phase: &mut RequestPhase,
        started: Instant,
    ) -> Result<EncodedImage> {
        let request = request.validate()?;
        *phase = RequestPhase::Validated;

        let state = self.models.state();
        if state != ServiceState::Ready {
            return Err(Error::Unavailable { state });
        }

        let preview: String = request.prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
        debug!(prompt = %preview, seed = ?request.seed, "generating image");

        *phase = RequestPhase::Synthesizing;
        let synthesis_started = Instant::now();
        let raw = self
            .models
            .synthesize(&request.prompt, SYNTHESIS_STEPS, request.seed)
            .await
            .map_err(|e| Error::generation_failed(*phase, e))?;
        let synthesis_ms = synthesis_started.elapsed().as_millis() as u64;

        *phase = RequestPhase::PostProcessing;
        let cropped =
            center_crop(&raw, self.aspect_ratio).map_err(|e| Error::generation_failed(*phase, e))?;
        drop(raw);

        *phase = RequestPhase::Encoding;
        let encoded = self
            .encoder
            .encode(&cropped, self.quality)
            .await
            .map_err(|e| Error::generation_failed(*phase, e))?;

        info!(
            prompt_len = request.prompt.chars().count(),
            seed = ?request.seed,
            width = cropped.width(),
            height = cropped.height(),
            bytes = encoded.bytes.len(),
            synthesis_ms,
            total_ms = started.elapsed().as_millis() as u64,
            "image generated"
        );
        Ok(encoded)
    }
}
