//! LLM inference.
//!
//! - [`engine`]: Prompt-to-text generation over a loaded model
//! - [`model_loader`]: Hub download, device selection and model construction
//! - [`sampling`]: Decoding parameter resolution

pub mod engine;
pub mod model_loader;
pub mod sampling;
