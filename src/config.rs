//! Runtime configuration for privacy-analyzer.
//!
//! Configuration is loaded from an optional JSON file and then patched with
//! command-line overrides. Every field has a default, so an absent file or a
//! partial one is fine.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Pretrained model served when nothing else is configured.
pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2.5-0.5B-Instruct";

/// Number of new tokens generated per request.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 100;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "privacy-analyzer",
    about = "Privacy policy analysis server backed by a local language model"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address, overrides `server.listen`.
    #[arg(long)]
    pub listen: Option<String>,

    /// Hugging Face model id, overrides `model.model_id`.
    #[arg(long)]
    pub model_id: Option<String>,

    /// Run on the CPU even when an accelerator is available.
    #[arg(long)]
    pub cpu: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Generation settings.
    pub generation: GenerationConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:5000").
    pub listen: String,

    /// Maximum requests admitted at once, waiting or generating.
    pub max_concurrent_requests: usize,

    /// Largest accepted request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5000".to_string(),
            max_concurrent_requests: 4,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Which weights to load and where to run them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hugging Face hub repository id.
    pub model_id: String,

    /// Repository revision (branch, tag or commit).
    pub revision: String,

    /// Skip accelerator detection and run on the CPU.
    pub force_cpu: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: "main".to_string(),
            force_cpu: false,
        }
    }
}

/// Decoding knobs. `None` means "use the model's generation_config.json".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Budget of new tokens per request.
    pub max_new_tokens: usize,

    /// Sampling temperature (0.0 = greedy).
    pub temperature: Option<f64>,

    /// Nucleus sampling threshold.
    pub top_p: Option<f64>,

    /// Top-k cutoff.
    pub top_k: Option<usize>,

    /// Repetition penalty (1.0 = off).
    pub repeat_penalty: Option<f32>,

    /// How many trailing tokens the repetition penalty looks at. Unset
    /// penalizes every token of the sequence, prompt included.
    pub repeat_last_n: Option<usize>,

    /// Fixed RNG seed. Random per request when unset.
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            temperature: None,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            repeat_last_n: None,
            seed: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the file configuration.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(model_id) = &cli.model_id {
            self.model.model_id = model_id.clone();
        }
        if cli.cpu {
            self.model.force_cpu = true;
        }
        self
    }
}
