//! Pretrained model loading.
//!
//! Resolves the files of a pretrained repository (from the Hugging Face hub
//! or a local directory), picks a device and dtype, and builds the model and
//! its tokenizer. Runs once at startup; everything here blocks.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2;
use hf_hub::api::sync::{Api, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::inference::sampling::HubGenerationConfig;

const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Tokens treated as end-of-sequence when the repo does not list any.
const FALLBACK_EOS_TOKENS: &[&str] = &["<|im_end|>", "<|endoftext|>", "</s>"];

#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("Hub download failed: {0}")]
    Hub(#[from] ApiError),

    #[error("Model file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid model metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    #[error("Unsupported model architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Failed to load tokenizer: {0}")]
    Tokenizer(String),

    #[error("Failed to build model: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Paths of everything needed to instantiate a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

/// Where model files come from.
enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    fn open(config: &ModelConfig) -> Result<Self, ModelLoaderError> {
        let local = Path::new(&config.model_id);
        if local.is_dir() {
            return Ok(ModelSource::Local(local.to_path_buf()));
        }
        let api = Api::new()?;
        Ok(ModelSource::Hub(api.repo(Repo::with_revision(
            config.model_id.clone(),
            RepoType::Model,
            config.revision.clone(),
        ))))
    }

    fn get(&self, file: &str) -> Result<PathBuf, ModelLoaderError> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(ModelLoaderError::FileNotFound(path.display().to_string()))
                }
            }
            ModelSource::Hub(repo) => Ok(repo.get(file)?),
        }
    }
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Shard file names listed in a `model.safetensors.index.json`, deduplicated and sorted.
pub fn shard_files(index_path: &Path) -> Result<Vec<String>, ModelLoaderError> {
    let data = std::fs::read_to_string(index_path)?;
    let index: WeightsIndex = serde_json::from_str(&data)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

/// Locate (downloading if needed) every file of the configured model.
pub fn fetch_model_files(config: &ModelConfig) -> Result<ModelFiles, ModelLoaderError> {
    let source = ModelSource::open(config)?;

    let model_config = source.get("config.json")?;
    let tokenizer = source.get("tokenizer.json")?;

    let generation_config = match source.get("generation_config.json") {
        Ok(path) => Some(path),
        Err(e) => {
            debug!("No generation_config.json for {}: {e}", config.model_id);
            None
        }
    };

    let weights = match source.get(SINGLE_WEIGHTS_FILE) {
        Ok(path) => vec![path],
        Err(_) => {
            let index = source.get(WEIGHTS_INDEX_FILE)?;
            shard_files(&index)?
                .iter()
                .map(|shard| source.get(shard))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(ModelFiles {
        config: model_config,
        tokenizer,
        generation_config,
        weights,
    })
}

/// Pick the best available device: CUDA, then Metal, then CPU.
pub fn select_device(force_cpu: bool) -> Result<Device, ModelLoaderError> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Half precision on accelerators, full precision on the CPU.
pub fn select_dtype(device: &Device) -> DType {
    if device.is_cuda() || device.is_metal() {
        DType::BF16
    } else {
        DType::F32
    }
}

#[derive(Deserialize)]
struct ArchitectureProbe {
    #[serde(default)]
    model_type: Option<String>,
}

/// Parse a model `config.json`, rejecting architectures we cannot run.
pub fn read_model_config(path: &Path) -> Result<qwen2::Config, ModelLoaderError> {
    let data = std::fs::read_to_string(path)?;
    let probe: ArchitectureProbe = serde_json::from_str(&data)?;
    match probe.model_type.as_deref() {
        Some("qwen2") => Ok(serde_json::from_str(&data)?),
        other => Err(ModelLoaderError::UnsupportedArchitecture(
            other.unwrap_or("unknown").to_string(),
        )),
    }
}

/// Read `generation_config.json`, treating a missing file as empty.
pub fn read_generation_config(
    path: Option<&Path>,
) -> Result<HubGenerationConfig, ModelLoaderError> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        }
        None => Ok(HubGenerationConfig::default()),
    }
}

/// End-of-sequence ids: the repo's list if present, else well-known special tokens.
pub fn resolve_eos_tokens(generation: &HubGenerationConfig, tokenizer: &Tokenizer) -> Vec<u32> {
    if let Some(ids) = &generation.eos_token_id {
        return ids.to_vec();
    }
    FALLBACK_EOS_TOKENS
        .iter()
        .filter_map(|token| tokenizer.token_to_id(token))
        .collect()
}

/// Everything produced by a successful load.
pub struct LoadedModel {
    pub model: qwen2::ModelForCausalLM,
    pub tokenizer: Tokenizer,
    pub device: Device,
    pub eos_token_ids: Vec<u32>,
    pub generation: HubGenerationConfig,
    /// Longest sequence the model attends over, prompt plus generated tokens.
    pub context_length: usize,
}

/// Load model weights and tokenizer for `config.model_id`.
pub fn load(config: &ModelConfig) -> Result<LoadedModel, ModelLoaderError> {
    info!(
        model = config.model_id,
        revision = config.revision,
        "Resolving model files"
    );
    let files = fetch_model_files(config)?;

    let device = select_device(config.force_cpu)?;
    let dtype = select_dtype(&device);
    info!(device = ?device, dtype = ?dtype, shards = files.weights.len(), "Loading weights");

    let model_config = read_model_config(&files.config)?;
    let generation = read_generation_config(files.generation_config.as_deref())?;

    let tokenizer = Tokenizer::from_file(&files.tokenizer)
        .map_err(|e| ModelLoaderError::Tokenizer(e.to_string()))?;

    let eos_token_ids = resolve_eos_tokens(&generation, &tokenizer);
    if eos_token_ids.is_empty() {
        warn!("No end-of-sequence token found, generation always runs to the token budget");
    }

    // SAFETY: the weight files are not modified while the process runs.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
    let model = qwen2::ModelForCausalLM::new(&model_config, vb)?;

    info!(
        layers = model_config.num_hidden_layers,
        vocab = model_config.vocab_size,
        context = model_config.max_position_embeddings,
        eos = ?eos_token_ids,
        "Model ready"
    );

    Ok(LoadedModel {
        model,
        tokenizer,
        device,
        eos_token_ids,
        generation,
        context_length: model_config.max_position_embeddings,
    })
}
