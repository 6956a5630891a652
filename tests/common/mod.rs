//! Shared fixtures: stub generators and request helpers.

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use privacy_analyzer::config::Config;
use privacy_analyzer::inference::engine::{Generation, InferenceError, TextGenerator};
use privacy_analyzer::server::analyze_api::{build_router, AppState};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`

/// Continuation appended by [`EchoGenerator`].
pub const CANNED_CONTINUATION: &str = " Score: 6/10<|im_end|>";

/// Echoes the prompt followed by a fixed continuation, like a real decode would.
#[derive(Default)]
pub struct EchoGenerator {
    pub calls: Mutex<Vec<(String, usize)>>,
}

impl TextGenerator for EchoGenerator {
    fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<Generation, InferenceError> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), max_new_tokens));
        Ok(Generation {
            text: format!("{prompt}{CANNED_CONTINUATION}"),
            prompt_tokens: prompt.split_whitespace().count(),
            completion_tokens: 4,
        })
    }
}

/// Always fails the way a tokenizer error would.
pub struct FailingGenerator;

impl TextGenerator for FailingGenerator {
    fn generate(&self, _prompt: &str, _max_new_tokens: usize) -> Result<Generation, InferenceError> {
        Err(InferenceError::Tokenize("unexpected byte sequence".to_string()))
    }
}

/// Refuses prompts longer than `limit` words, like an engine at its context length.
pub struct ContextLimitedGenerator {
    pub limit: usize,
}

impl TextGenerator for ContextLimitedGenerator {
    fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<Generation, InferenceError> {
        let prompt_tokens = prompt.split_whitespace().count();
        if prompt_tokens + max_new_tokens > self.limit {
            return Err(InferenceError::PromptTooLong {
                prompt_tokens,
                max_new_tokens,
                limit: self.limit,
            });
        }
        Ok(Generation {
            text: format!("{prompt}{CANNED_CONTINUATION}"),
            prompt_tokens,
            completion_tokens: 4,
        })
    }
}

/// Panics inside the worker thread.
pub struct PanickingGenerator;

impl TextGenerator for PanickingGenerator {
    fn generate(&self, _prompt: &str, _max_new_tokens: usize) -> Result<Generation, InferenceError> {
        panic!("out of memory");
    }
}

/// Blocks inside `generate` until the test releases it.
pub struct GatedGenerator {
    entered: tokio::sync::mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl GatedGenerator {
    pub fn new() -> (Self, tokio::sync::mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = tokio::sync::mpsc::channel(4);
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                entered: entered_tx,
                release: Mutex::new(release_rx),
            },
            entered_rx,
            release_tx,
        )
    }
}

impl TextGenerator for GatedGenerator {
    fn generate(&self, prompt: &str, _max_new_tokens: usize) -> Result<Generation, InferenceError> {
        let _ = self.entered.blocking_send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(Generation {
            text: prompt.to_string(),
            prompt_tokens: 1,
            completion_tokens: 0,
        })
    }
}

pub fn test_app(generator: Arc<dyn TextGenerator>) -> Router {
    test_app_with_config(generator, &Config::default())
}

pub fn test_app_with_config(generator: Arc<dyn TextGenerator>, config: &Config) -> Router {
    build_router(Arc::new(AppState::new(generator, config)))
}

pub fn json_request(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/analyze")
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

/// Send one request and return status plus parsed JSON body.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}
