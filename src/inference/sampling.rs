//! Sampling parameter resolution.
//!
//! A pretrained repository usually ships a `generation_config.json` with the
//! decoding defaults its authors intended. Values set in our own
//! [`GenerationConfig`] win over it; anything neither side sets falls back to
//! greedy decoding.

use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::Deserialize;

use crate::config::GenerationConfig;

/// `top_k` used by the hub tooling when sampling is on and the repo gives none.
const HUB_DEFAULT_TOP_K: usize = 50;

/// The subset of a hub `generation_config.json` that affects decoding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubGenerationConfig {
    #[serde(default)]
    pub do_sample: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
}

/// `eos_token_id` is either a single id or a list of ids.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            EosTokenId::Single(id) => vec![*id],
            EosTokenId::Multiple(ids) => ids.clone(),
        }
    }
}

/// Fully resolved decoding parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// 0.0 selects argmax decoding.
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repeat_penalty: f32,
    /// Trailing window the repetition penalty looks at. `None` covers the whole sequence.
    pub repeat_last_n: Option<usize>,
    pub seed: Option<u64>,
}

impl SamplingParams {
    /// Deterministic argmax decoding with no penalty.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: None,
            top_k: None,
            repeat_penalty: 1.0,
            repeat_last_n: None,
            seed: None,
        }
    }

    /// Merge configured overrides with the repository defaults.
    pub fn resolve(overrides: &GenerationConfig, hub: &HubGenerationConfig) -> Self {
        let hub_samples = hub.do_sample.unwrap_or(false);

        let temperature = overrides.temperature.unwrap_or(if hub_samples {
            hub.temperature.unwrap_or(1.0)
        } else {
            0.0
        });

        let hub_top_k = if hub_samples {
            hub.top_k.or(Some(HUB_DEFAULT_TOP_K))
        } else {
            hub.top_k
        };

        Self {
            temperature,
            top_p: overrides.top_p.or(hub.top_p),
            top_k: overrides.top_k.or(hub_top_k),
            repeat_penalty: overrides
                .repeat_penalty
                .or(hub.repetition_penalty)
                .unwrap_or(1.0),
            repeat_last_n: overrides.repeat_last_n,
            seed: overrides.seed,
        }
    }

    /// Map onto candle's sampling strategy.
    pub fn sampling(&self) -> Sampling {
        if self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        // top_p of 1.0 keeps the whole distribution, so it is the same as no nucleus cut.
        let top_p = self.top_p.filter(|p| *p < 1.0);
        let top_k = self.top_k.filter(|k| *k > 0);

        match (top_k, top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }

    /// A fresh logits processor for one generation call.
    pub fn logits_processor(&self) -> LogitsProcessor {
        let seed = self.seed.unwrap_or_else(rand::random);
        LogitsProcessor::from_sampling(seed, self.sampling())
    }
}
