//! FLUX.1-schnell text-to-image pipeline loaded from a local weights
//! directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{self, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{tensor_to_image, ImageModel, Loader};

/// Output resolution of the pipeline. Both sides must be multiples of 16.
pub const FLUX_WIDTH: usize = 1024;
pub const FLUX_HEIGHT: usize = 1024;

const T5_MAX_TOKENS: usize = 256;

/// One file of the local weights layout and where it comes from on the hub.
#[derive(Debug, Clone, Copy)]
pub struct WeightFile {
    pub repo: &'static str,
    pub revision: Option<&'static str>,
    pub remote: &'static str,
    pub local: &'static str,
}

pub const T5_MODEL: WeightFile = WeightFile {
    repo: "google/t5-v1_1-xxl",
    revision: Some("refs/pr/2"),
    remote: "model.safetensors",
    local: "t5/model.safetensors",
};
pub const T5_CONFIG: WeightFile = WeightFile {
    repo: "google/t5-v1_1-xxl",
    revision: Some("refs/pr/2"),
    remote: "config.json",
    local: "t5/config.json",
};
pub const T5_TOKENIZER: WeightFile = WeightFile {
    repo: "lmz/mt5-tokenizers",
    revision: None,
    remote: "t5-v1_1-xxl.tokenizer.json",
    local: "t5/tokenizer.json",
};
pub const CLIP_MODEL: WeightFile = WeightFile {
    repo: "openai/clip-vit-large-patch14",
    revision: None,
    remote: "model.safetensors",
    local: "clip/model.safetensors",
};
pub const CLIP_TOKENIZER: WeightFile = WeightFile {
    repo: "openai/clip-vit-large-patch14",
    revision: None,
    remote: "tokenizer.json",
    local: "clip/tokenizer.json",
};
pub const AUTOENCODER: WeightFile = WeightFile {
    repo: "black-forest-labs/FLUX.1-schnell",
    revision: None,
    remote: "ae.safetensors",
    local: "flux/ae.safetensors",
};
pub const FLUX_TRANSFORMER: WeightFile = WeightFile {
    repo: "black-forest-labs/FLUX.1-schnell",
    revision: None,
    remote: "flux1-schnell.safetensors",
    local: "flux/flux1-schnell.safetensors",
};

pub const WEIGHT_FILES: [WeightFile; 7] = [
    T5_MODEL,
    T5_CONFIG,
    T5_TOKENIZER,
    CLIP_MODEL,
    CLIP_TOKENIZER,
    AUTOENCODER,
    FLUX_TRANSFORMER,
];

/// Returns the weight files missing from `root`, as local relative paths.
pub fn missing_weight_files(root: &Path) -> Vec<&'static str> {
    WEIGHT_FILES
        .iter()
        .filter(|file| !root.join(file.local).is_file())
        .map(|file| file.local)
        .collect()
}

pub struct FluxModel {
    device: Device,
    dtype: DType,
    width: usize,
    height: usize,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl ImageModel for FluxModel {
    fn synthesize(&mut self, prompt: &str, steps: usize, seed: Option<u64>) -> Result<DynamicImage> {
        let noise_img = match seed {
            Some(seed) => seeded_noise(seed, self.height, self.width, &self.device)?,
            None => sampling::get_noise(1, self.height, self.width, &self.device)?,
        }
        .to_dtype(self.dtype)?;

        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = sampling::get_schedule(steps, None);

        // schnell is guidance-distilled
        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            0.0,
        )?;
        let unpacked = sampling::unpack(&latent_img, self.height, self.width)?;
        debug!(steps, "denoised latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!("decoded latent image");

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

/// Same shape and distribution as `sampling::get_noise`, drawn from a seeded
/// RNG so the result does not depend on the device's generator.
fn seeded_noise(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let height = height.div_ceil(16) * 2;
    let width = width.div_ceil(16) * 2;
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..16 * height * width)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, (1, 16, height, width), device)?)
}

pub struct FluxLoader {
    pub width: usize,
    pub height: usize,
}

impl Default for FluxLoader {
    fn default() -> Self {
        Self {
            width: FLUX_WIDTH,
            height: FLUX_HEIGHT,
        }
    }
}

impl Loader for FluxLoader {
    type Model = FluxModel;

    async fn load(&self, weights: &Path, device: &Device) -> Result<Self::Model> {
        if self.width % 16 != 0 || self.height % 16 != 0 {
            anyhow::bail!(
                "output size {}x{} is not a multiple of 16",
                self.width,
                self.height
            );
        }
        let missing = missing_weight_files(weights);
        if !missing.is_empty() {
            anyhow::bail!(
                "weights directory {} is missing {}",
                weights.display(),
                missing.join(", ")
            );
        }

        let root = weights.to_path_buf();
        let device = device.clone();
        let (width, height) = (self.width, self.height);
        tokio::task::spawn_blocking(move || load_blocking(root, device, width, height)).await?
    }
}

fn load_blocking(root: PathBuf, device: Device, width: usize, height: usize) -> Result<FluxModel> {
    let dtype = device.bf16_default_to_f32();
    info!(root = %root.display(), ?dtype, "loading FLUX.1-schnell weights");
    let path = |file: WeightFile| root.join(file.local);

    let t5_vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path(T5_MODEL)], dtype, &device)
            .context("failed to build T5 var builder")?
    };
    let config_str =
        std::fs::read_to_string(path(T5_CONFIG)).context("failed to read T5 config")?;
    let t5_config: t5::Config =
        serde_json::from_str(&config_str).context("failed to parse T5 config")?;
    let t5_model = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
    let t5_tokenizer = Tokenizer::from_file(path(T5_TOKENIZER))
        .map_err(Error::msg)
        .context("failed to load T5 tokenizer")?;
    debug!("loaded T5 encoder");

    let clip_vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path(CLIP_MODEL)], dtype, &device)
            .context("failed to build CLIP var builder")?
    };
    let clip_config = ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: text_model::Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    };
    let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
        .context("failed to load CLIP model")?;
    let clip_tokenizer = Tokenizer::from_file(path(CLIP_TOKENIZER))
        .map_err(Error::msg)
        .context("failed to load CLIP tokenizer")?;
    debug!("loaded CLIP encoder");

    let autoencoder_vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path(AUTOENCODER)], dtype, &device)
            .context("failed to build autoencoder var builder")?
    };
    let autoencoder = AutoEncoder::new(&autoencoder::Config::schnell(), autoencoder_vb)
        .context("failed to load autoencoder")?;

    let flux_vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[path(FLUX_TRANSFORMER)], dtype, &device)
            .context("failed to build flux var builder")?
    };
    let flux_model =
        Flux::new(&model::Config::schnell(), flux_vb).context("failed to load flux model")?;
    debug!("loaded flux transformer and autoencoder");

    Ok(FluxModel {
        device,
        dtype,
        width,
        height,
        t5_model,
        t5_tokenizer,
        clip_model,
        clip_tokenizer,
        autoencoder,
        flux_model,
    })
}
