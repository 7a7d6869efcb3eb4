#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    http::{Request, StatusCode},
    Router,
};
use futures::future::{self, BoxFuture};
use futures::stream::{self, StreamExt};
use llama_gateway::{
    create_router, AppState, ChunkStream, GatewayConfig, GenerationError, GenerationOptions,
    TextGenerator,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// What the stub engine does for every call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Yield these chunks, then finish.
    Chunks(Vec<&'static str>),
    /// Fail before any chunk, while opening the session.
    FailSession(&'static str),
    /// Yield these chunks, then fail.
    FailAfter(Vec<&'static str>, &'static str),
    /// Yield this chunk forever.
    Endless(&'static str),
}

/// Marks a stream as released once the stream that owns it is dropped.
#[derive(Debug)]
struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Scripted generator that records every prompt it receives.
#[derive(Debug)]
pub struct StubGenerator {
    script: Script,
    prompts: Mutex<Vec<String>>,
    released: Arc<AtomicBool>,
}

impl StubGenerator {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            prompts: Mutex::new(Vec::new()),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn replying(chunks: Vec<&'static str>) -> Self {
        Self::new(Script::Chunks(chunks))
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Whether an `Endless` stream handed out by this stub has been dropped.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl TextGenerator for StubGenerator {
    fn generate_stream(
        &self,
        prompt: String,
        _options: GenerationOptions,
    ) -> BoxFuture<'static, Result<ChunkStream, GenerationError>> {
        self.prompts.lock().unwrap().push(prompt);

        let result = match &self.script {
            Script::Chunks(chunks) => {
                let items: Vec<Result<String, GenerationError>> =
                    chunks.iter().map(|c| Ok(c.to_string())).collect();
                Ok(stream::iter(items).boxed())
            }
            Script::FailSession(message) => Err(GenerationError::Session(message.to_string())),
            Script::FailAfter(chunks, message) => {
                let mut items: Vec<Result<String, GenerationError>> =
                    chunks.iter().map(|c| Ok(c.to_string())).collect();
                items.push(Err(GenerationError::Engine(message.to_string())));
                Ok(stream::iter(items).boxed())
            }
            Script::Endless(chunk) => {
                let chunk = *chunk;
                let guard = ReleaseGuard(self.released.clone());
                Ok(stream::repeat_with(move || {
                    let _held = &guard;
                    Ok::<_, GenerationError>(chunk.to_string())
                })
                .boxed())
            }
        };

        Box::pin(future::ready(result))
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        model_path: "/models/test.gguf".into(),
        ..GatewayConfig::default()
    }
}

pub fn app_with(stub: StubGenerator, config: GatewayConfig) -> (Router, Arc<StubGenerator>) {
    let stub = Arc::new(stub);
    let router = create_router(AppState::new(stub.clone(), config));
    (router, stub)
}

pub fn app(stub: StubGenerator) -> (Router, Arc<StubGenerator>) {
    app_with(stub, test_config())
}

pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, Option<String>, Bytes) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, body)
}

pub fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let (status, _, bytes) = send(app, post(uri, &body)).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Payloads of every `data:` frame, in order. `[DONE]` is returned as a string.
pub fn sse_payloads(body: &[u8]) -> Vec<Value> {
    String::from_utf8(body.to_vec())
        .unwrap()
        .split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let payload = frame
                .strip_prefix("data: ")
                .unwrap_or_else(|| panic!("unexpected SSE frame: {frame:?}"));
            if payload == "[DONE]" {
                Value::String(payload.to_string())
            } else {
                serde_json::from_str(payload).unwrap()
            }
        })
        .collect()
}
