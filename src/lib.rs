//! privacy-analyzer: privacy policy analysis over a local language model.
//!
//! Accepts a privacy-policy document over HTTP, prefixes it with a scoring
//! instruction, runs a pretrained causal language model on it and returns
//! the decoded output (prompt echo included).

pub mod config;
pub mod inference;
pub mod server;
