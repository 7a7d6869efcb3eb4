use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::sse::Sse,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::emitter::{self, Protocol, ResponseContext};
use crate::engine::TextGenerator;
use crate::error::ApiError;
use crate::messages::{normalize, Message, MessageContent, RawMessage, Role};
use crate::prompt::render_prompt;

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<dyn TextGenerator>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(generator: Arc<dyn TextGenerator>, config: GatewayConfig) -> Self {
        Self {
            generator,
            config: Arc::new(config),
        }
    }
}

/// OpenAI `/v1/chat/completions` body.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Claude `/v1/messages` body.
#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub model: Option<String>,
    /// Top-level system prompt, string or text blocks.
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

/// Protocol-independent request after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
}

impl CompletionRequest {
    fn validate(self) -> Result<Self, ApiError> {
        if self.messages.is_empty() {
            return Err(ApiError::MissingMessages);
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ApiError::BadRequest(
                    "temperature must be between 0 and 2".to_string(),
                ));
            }
        }
        Ok(self)
    }
}

impl From<ChatCompletionRequest> for CompletionRequest {
    fn from(req: ChatCompletionRequest) -> Self {
        Self {
            messages: normalize(&req.messages),
            model: req.model,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream: req.stream.unwrap_or(false),
        }
    }
}

impl TryFrom<MessagesRequest> for CompletionRequest {
    type Error = ApiError;

    fn try_from(req: MessagesRequest) -> Result<Self, ApiError> {
        // `system` alone is not a conversation
        let conversation = normalize(&req.messages);
        if conversation.is_empty() {
            return Err(ApiError::MissingMessages);
        }

        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if let Some(system) = req.system {
            let content = MessageContent::from_value(system)
                .map_err(|e| ApiError::BadRequest(format!("system: {e}")))?;
            let text = content.as_text();
            if !text.is_empty() {
                messages.push(Message::new(Role::System, text));
            }
        }
        messages.extend(conversation);

        Ok(Self {
            messages,
            model: req.model,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream: req.stream.unwrap_or(false),
        })
    }
}

/// Parses a completion body, rejecting a missing or non-array `messages`
/// before looking at anything else.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))?
    };

    if !value.get("messages").is_some_and(Value::is_array) {
        return Err(ApiError::MissingMessages);
    }

    serde_json::from_value(value).map_err(|e| ApiError::BadRequest(e.to_string()))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: ChatCompletionRequest = parse_body(&body)?;
    tracing::info!(
        model = ?req.model,
        message_count = req.messages.len(),
        stream = req.stream.unwrap_or(false),
        "Received chat completion request"
    );

    let request = CompletionRequest::from(req).validate()?;
    respond(state, Protocol::OpenAi, request).await
}

pub async fn messages(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: MessagesRequest = parse_body(&body)?;
    tracing::info!(
        model = ?req.model,
        message_count = req.messages.len(),
        stream = req.stream.unwrap_or(false),
        "Received messages request"
    );

    let request = CompletionRequest::try_from(req)?.validate()?;
    respond(state, Protocol::Claude, request).await
}

async fn respond(
    state: AppState,
    protocol: Protocol,
    request: CompletionRequest,
) -> Result<Response, ApiError> {
    let prompt = render_prompt(&request.messages);
    let options = state.config.options(request.max_tokens, request.temperature);
    let model = request
        .model
        .unwrap_or_else(|| state.config.model_name.clone());
    let ctx = ResponseContext::new(protocol, model);

    tracing::debug!(
        id = %ctx.id,
        prompt_length = prompt.len(),
        max_tokens = options.max_tokens,
        temperature = options.temperature,
        "Built prompt from messages"
    );
    tracing::trace!(prompt = %prompt, "Full prompt text");

    if request.stream {
        let chunks = match state.generator.generate_stream(prompt, options).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(id = %ctx.id, error = %e, "Failed to open generation session");
                stream::once(async move { Err(e) }).boxed()
            }
        };

        tracing::info!(id = %ctx.id, model = %ctx.model, "Starting streaming completion");
        let events = emitter::frames(protocol, ctx, chunks)
            .map(|frame| Ok::<_, Infallible>(frame.into_event()));
        return Ok(Sse::new(events).into_response());
    }

    let text = state.generator.generate(prompt.clone(), options).await?;
    tracing::info!(
        id = %ctx.id,
        response_length = text.len(),
        "Received completion from model"
    );
    tracing::trace!(response = %text, "Model response text");

    Ok(Json(emitter::final_body(protocol, &ctx, &prompt, &text)).into_response())
}

fn provided_key(headers: &HeaderMap) -> Option<&str> {
    let raw = headers
        .get("x-api-key")
        .or_else(|| headers.get(header::AUTHORIZATION))?
        .to_str()
        .ok()?
        .trim();
    let key = match raw.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => &raw[7..],
        _ => raw,
    };
    Some(key.trim())
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.config.api_key() {
        if provided_key(request.headers()) != Some(expected) {
            tracing::warn!(path = %request.uri().path(), "Rejected request with invalid API key");
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.config.model_path.display().to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelsListResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsListResponse> {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    Json(ModelsListResponse {
        object: "list",
        data: vec![ModelObject {
            id: state.config.model_name.clone(),
            object: "model",
            created,
            owned_by: "local",
        }],
    })
}

pub fn create_router(state: AppState) -> Router {
    let completions = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(completions)
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds `addr` and serves until Ctrl-C.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    use anyhow::Context;

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("OpenAI-compatible endpoint: http://{}/v1/chat/completions", addr);
    tracing::info!("Claude-compatible endpoint: http://{}/v1/messages", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
