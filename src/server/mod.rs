//! HTTP server exposing the analysis endpoint.
//!
//! - [`analyze_api`]: Router, handler and error mapping
//! - [`protocol`]: Wire constants and payload types

pub mod analyze_api;
pub mod protocol;
