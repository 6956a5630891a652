//! Text generation over a loaded causal language model.
//!
//! The engine is built once at startup and then only read. It:
//! 1. Tokenizes the prompt
//! 2. Runs a prefill pass over the whole prompt, then one token per step
//! 3. Stops at an end-of-sequence token or when the new-token budget runs out
//! 4. Decodes prompt and continuation together, special tokens included

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::qwen2;
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::config::Config;
use crate::inference::model_loader::{self, LoadedModel, ModelLoaderError};
use crate::inference::sampling::SamplingParams;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Model execution failed: {0}")]
    Model(#[from] candle_core::Error),

    #[error("Detokenization failed: {0}")]
    Decode(String),

    #[error("Prompt of {prompt_tokens} tokens plus {max_new_tokens} new tokens exceeds the model context of {limit}")]
    PromptTooLong {
        prompt_tokens: usize,
        max_new_tokens: usize,
        limit: usize,
    },
}

/// Output of one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Prompt echo followed by the generated continuation.
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Anything that can turn a prompt into text. The HTTP layer only sees this.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<Generation, InferenceError>;
}

/// A causal LM with an internal KV cache.
pub trait CausalLm: Send {
    /// Logits for the last position of `input_ids`, shape `(batch, 1, vocab)`.
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor>;

    fn clear_kv_cache(&mut self);
}

impl CausalLm for qwen2::ModelForCausalLM {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor> {
        qwen2::ModelForCausalLM::forward(self, input_ids, seqlen_offset)
    }

    fn clear_kv_cache(&mut self) {
        qwen2::ModelForCausalLM::clear_kv_cache(self)
    }
}

/// The inference engine.
pub struct InferenceEngine {
    /// The KV cache makes every forward pass a mutation, so calls are serialized here.
    model: Mutex<Box<dyn CausalLm>>,

    tokenizer: Tokenizer,

    device: Device,

    eos_token_ids: Vec<u32>,

    sampling: SamplingParams,

    /// Longest sequence (prompt plus generated tokens) the model accepts.
    context_length: usize,
}

impl InferenceEngine {
    /// Create an engine from already-constructed parts.
    pub fn new(
        model: Box<dyn CausalLm>,
        tokenizer: Tokenizer,
        device: Device,
        eos_token_ids: Vec<u32>,
        sampling: SamplingParams,
        context_length: usize,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            eos_token_ids,
            sampling,
            context_length,
        }
    }

    /// Download and build the configured model. Blocks until the weights are in memory.
    pub fn load(config: &Config) -> Result<Self, ModelLoaderError> {
        let LoadedModel {
            model,
            tokenizer,
            device,
            eos_token_ids,
            generation,
            context_length,
        } = model_loader::load(&config.model)?;

        let sampling = SamplingParams::resolve(&config.generation, &generation);
        debug!(?sampling, "Resolved sampling parameters");

        Ok(Self::new(
            Box::new(model),
            tokenizer,
            device,
            eos_token_ids,
            sampling,
            context_length,
        ))
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    fn next_logits(
        &self,
        model: &mut dyn CausalLm,
        context: &[u32],
        offset: usize,
    ) -> Result<Tensor, InferenceError> {
        let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
        let logits = model
            .forward(&input, offset)?
            .squeeze(0)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;
        Ok(logits)
    }
}

impl TextGenerator for InferenceEngine {
    fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<Generation, InferenceError> {
        let started = Instant::now();

        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| InferenceError::Tokenize(e.to_string()))?;
        let mut tokens = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            return Err(InferenceError::EmptyPrompt);
        }
        let prompt_len = tokens.len();

        // The attention mask for the prefill pass is quadratic in the prompt
        // length, so oversized prompts are refused before touching the model.
        if prompt_len.saturating_add(max_new_tokens) > self.context_length {
            return Err(InferenceError::PromptTooLong {
                prompt_tokens: prompt_len,
                max_new_tokens,
                limit: self.context_length,
            });
        }

        let mut logits_processor = self.sampling.logits_processor();

        {
            // A call that failed or panicked halfway only leaves stale KV
            // entries behind, and those are cleared right below.
            let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
            model.clear_kv_cache();

            for step in 0..max_new_tokens {
                let context_size = if step > 0 { 1 } else { tokens.len() };
                let offset = tokens.len() - context_size;

                let logits = self.next_logits(&mut **model, &tokens[offset..], offset)?;
                let logits = if self.sampling.repeat_penalty == 1.0 {
                    logits
                } else {
                    let start_at = self
                        .sampling
                        .repeat_last_n
                        .map_or(0, |n| tokens.len().saturating_sub(n));
                    candle_transformers::utils::apply_repeat_penalty(
                        &logits,
                        self.sampling.repeat_penalty,
                        &tokens[start_at..],
                    )?
                };

                let next_token = logits_processor.sample(&logits)?;
                tokens.push(next_token);

                if self.eos_token_ids.contains(&next_token) {
                    break;
                }
            }

            model.clear_kv_cache();
        }

        let text = self
            .tokenizer
            .decode(&tokens, false)
            .map_err(|e| InferenceError::Decode(e.to_string()))?;

        let completion_tokens = tokens.len() - prompt_len;
        debug!(
            prompt_tokens = prompt_len,
            completion_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation complete"
        );

        Ok(Generation {
            text,
            prompt_tokens: prompt_len,
            completion_tokens,
        })
    }
}
