use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::{Repo, RepoType, api::sync::Api};
use image::imageops::FilterType;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    provider::EmbeddingProvider,
    vector::FeatureVector,
};

pub const DEFAULT_MODEL_ID: &str = "openai/clip-vit-base-patch32";
/// The main branch of the default model has no safetensors weights.
pub const DEFAULT_REVISION: &str = "refs/pr/15";
pub const MODEL_ENV_VAR: &str = "CLIPSEEK_MODEL";
pub const DEVICE_ENV_VAR: &str = "CLIPSEEK_DEVICE";

/// Context length of the CLIP text encoder.
const MAX_TEXT_TOKENS: usize = 77;
const PAD_TOKEN: &str = "<|endoftext|>";

/// Per-channel RGB statistics of the CLIP training set.
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Compute device requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeviceChoice {
    /// CUDA or Metal when compiled in and available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceChoice {
    pub fn resolve(self) -> Result<Device> {
        match self {
            Self::Auto => Ok(default_device()),
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => Device::new_cuda(0).map_err(map_candle_err),
            Self::Metal => Device::new_metal(0).map_err(map_candle_err),
        }
    }
}

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// CLIP image/text encoder running on candle.
pub struct ClipProvider {
    model: ClipModel,
    tokenizer: Tokenizer,
    device: Device,
    image_size: usize,
    pad_id: u32,
    space_version: String,
}

impl ClipProvider {
    /// Download (or reuse from the hub cache) the weights and tokenizer of
    /// a ViT-B/32 CLIP checkpoint and load them onto `device`.
    pub fn load(model_id: &str, revision: &str, device: Device) -> Result<Self> {
        let api = Api::new().map_err(|e| {
            Error::Config(format!("cannot initialise model hub client: {e}"))
        })?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let fetch = |file: &str| {
            repo.get(file).map_err(|e| {
                Error::Config(format!("cannot fetch {file} for {model_id}: {e}"))
            })
        };
        let weights = fetch("model.safetensors")?;
        let tokenizer_file = fetch("tokenizer.json")?;

        let tokenizer = Tokenizer::from_file(&tokenizer_file).map_err(|e| {
            Error::Config(format!("cannot load tokenizer: {e}"))
        })?;
        let pad_id = tokenizer.token_to_id(PAD_TOKEN).ok_or_else(|| {
            Error::Config(format!("tokenizer has no {PAD_TOKEN} token"))
        })?;

        let config = ClipConfig::vit_base_patch32();
        // SAFETY: the weights file is not modified while it is mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)
                .map_err(map_candle_err)?
        };
        let model = ClipModel::new(vb, &config).map_err(map_candle_err)?;
        info!(model = model_id, revision, device = ?device, "loaded CLIP model");

        Ok(Self {
            model,
            tokenizer,
            device,
            image_size: config.image_size,
            pad_id,
            space_version: format!("{model_id}@{revision}"),
        })
    }

    fn tokenize(&self, texts: &[String]) -> Result<Tensor> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::Provider(format!("tokenization failed: {e}")))?;

        let mut rows: Vec<Vec<u32>> =
            encodings.iter().map(|e| e.get_ids().to_vec()).collect();
        for row in &mut rows {
            // Keep an end-of-text token last; pooling reads it.
            if row.len() > MAX_TEXT_TOKENS {
                row.truncate(MAX_TEXT_TOKENS - 1);
                row.push(self.pad_id);
            }
        }

        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let flat: Vec<u32> = rows
            .into_iter()
            .flat_map(|mut row| {
                row.resize(width, self.pad_id);
                row
            })
            .collect();

        Tensor::from_vec(flat, (texts.len(), width), &self.device)
            .map_err(map_candle_err)
    }

    fn preprocess(&self, image: &[u8]) -> Result<Tensor> {
        preprocess_image(image, self.image_size, &self.device)
    }
}

impl EmbeddingProvider for ClipProvider {
    fn space_version(&self) -> &str {
        &self.space_version
    }

    fn embed_text(&self, texts: &[String]) -> Result<Vec<FeatureVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let input_ids = self.tokenize(texts)?;
        let features = self
            .model
            .get_text_features(&input_ids)
            .map_err(map_candle_err)?;
        debug!(count = texts.len(), "encoded texts");
        rows_to_vectors(&features)
    }

    fn embed_image(&self, image: &[u8]) -> Result<FeatureVector> {
        let pixels = self.preprocess(image)?;
        let features = self
            .model
            .get_image_features(&pixels)
            .map_err(map_candle_err)?;

        rows_to_vectors(&features)?.pop().ok_or_else(|| {
            Error::Provider("image encoder returned no features".to_string())
        })
    }
}

/// Turn encoded image bytes into a `[1, 3, size, size]` pixel tensor.
///
/// The shortest side is resized to `size`, the centre is cropped, and each
/// channel is normalized with the mean and std CLIP was trained with.
fn preprocess_image(bytes: &[u8], size: usize, device: &Device) -> Result<Tensor> {
    let image = image::load_from_memory(bytes).map_err(|e| {
        Error::Provider(format!("cannot decode image: {e}"))
    })?;

    let target = size as u32;
    let (width, height) = (image.width(), image.height());
    let scale = target as f64 / width.min(height).max(1) as f64;
    let resized_w = ((width as f64 * scale).round() as u32).max(target);
    let resized_h = ((height as f64 * scale).round() as u32).max(target);
    let pixels = image
        .resize_exact(resized_w, resized_h, FilterType::CatmullRom)
        .crop_imm(
            (resized_w - target) / 2,
            (resized_h - target) / 2,
            target,
            target,
        )
        .to_rgb8()
        .into_raw();

    let mean = Tensor::new(&CLIP_MEAN, device).and_then(|t| t.reshape((3, 1, 1)));
    let std = Tensor::new(&CLIP_STD, device).and_then(|t| t.reshape((3, 1, 1)));
    let (mean, std) = (mean.map_err(map_candle_err)?, std.map_err(map_candle_err)?);

    Tensor::from_vec(pixels, (size, size, 3), device)
        .and_then(|t| t.permute((2, 0, 1)))
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.affine(1.0 / 255.0, 0.0))
        .and_then(|t| t.broadcast_sub(&mean))
        .and_then(|t| t.broadcast_div(&std))
        .and_then(|t| t.unsqueeze(0))
        .map_err(map_candle_err)
}

/// Convert a `[batch, dim]` tensor into normalized vectors.
fn rows_to_vectors(features: &Tensor) -> Result<Vec<FeatureVector>> {
    let rows = features
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(map_candle_err)?;
    rows.into_iter().map(FeatureVector::normalize).collect()
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::Provider(format!("tensor computation error: {e}"))
}
