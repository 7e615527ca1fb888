#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-proxy** – The HTTP transport.
//!
//! An OpenAI-compatible chat endpoint that enriches each request with a
//! tool-use policy, a hydration block of authoritative artifacts, and a
//! recall block of project memory before forwarding upstream; a user-code
//! endpoint that feeds the write-head promotion path; and a health probe.
//! Streaming responses are passed through chunk-for-chunk with one
//! `tinymem.memory_status` event injected ahead of the upstream data, and
//! the completed text is post-processed (stored, resolved, gated, audited)
//! once the stream ends.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tinymem_audit::ShadowAuditor;
use tinymem_config::Config;
use tinymem_hydration::{Hydration, HydrationConfig, HydrationEngine};
use tinymem_ledger::Ledger;
use tinymem_recall::{CoVeConfig, CoVeFilter, RecallConfig, RecallEngine, RecallOutcome};
use tinymem_resolver::Resolver;
use tinymem_state::StateMachine;
use tinymem_store::Store;
use tinymem_types::{ContentType, EpisodeId, Result, TinyMemError};
use tinymem_upstream::{HttpUpstream, UpstreamConfig};
use tinymem_vault::Vault;

pub mod extract;
pub mod turn;

/// Recall status header values.
const RECALL_STATUS_NONE: &str = "none";
const RECALL_STATUS_INJECTED: &str = "injected";
const RECALL_STATUS_FAILED: &str = "failed";

const TOOL_POLICY: &str = "You are assisted by tinyMem, an evidence-gated project memory. \
Treat injected authoritative artifacts as the current ground truth; do not re-derive them from \
conversation history, do not invent files or symbols that were not shown, and present unverified \
statements as claims rather than facts.";

/// Everything the handlers share. Cheap to clone; every field is a handle.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// Shared store handle.
    pub store: Store,
    /// Artifact vault.
    pub vault: Vault,
    /// Append-only ledger.
    pub ledger: Ledger,
    /// Resolution pipeline.
    pub resolver: Arc<Resolver>,
    /// Promotion state machine.
    pub machine: StateMachine,
    /// Hydration engine.
    pub hydration: HydrationEngine,
    /// Recall engine.
    pub recall: RecallEngine,
    /// Upstream chat client.
    pub upstream: HttpUpstream,
    /// Shadow auditor.
    pub auditor: ShadowAuditor,
}

/// Open the store at the configured path and assemble the full state.
pub async fn build_state(config: Config) -> Result<AppState> {
    let store = Store::open(config.store_path()).await?;
    build_state_with_store(config, store)
}

/// Assemble the state over an existing store (tests use an in-memory one).
pub fn build_state_with_store(config: Config, store: Store) -> Result<AppState> {
    let vault = Vault::new(store.clone());
    let ledger = Ledger::new(store.clone());
    let resolver = Arc::new(Resolver::new(store.clone()));
    let machine = StateMachine::new(store.clone(), ledger.clone(), ".");
    let upstream = HttpUpstream::new(UpstreamConfig {
        base_url: config.upstream_base_url.clone(),
        model: config.upstream_model.clone(),
        timeout: Duration::from_secs(config.upstream_timeout_seconds),
    })?;
    let hydration = HydrationEngine::new(
        store.clone(),
        vault.clone(),
        ledger.clone(),
        machine.clone(),
        HydrationConfig {
            max_tokens: config.hydration.max_tokens,
            recent_episodes: config.hydration.recent_episodes,
            include_stale: config.hydration.include_stale,
        },
    );
    let cove = (config.cove.enabled && config.cove.recall_filter_enabled).then(|| {
        CoVeFilter::new(
            Arc::new(upstream.clone()),
            store.clone(),
            CoVeConfig {
                enabled: true,
                confidence_threshold: config.cove.confidence_threshold,
                max_candidates: config.cove.max_candidates,
                timeout: Duration::from_secs(config.cove.timeout_seconds),
            },
        )
    });
    let recall = RecallEngine::new(
        store.clone(),
        RecallConfig {
            max_items: config.recall.max_items,
            max_tokens: config.recall.max_tokens,
            always_tier_fraction: config.recall.always_tier_fraction,
            timeout: Duration::from_secs(config.recall.timeout_seconds),
            metrics_enabled: config.metrics_enabled,
            dormant_after_hours: 168,
            tasks_path: Some(config.tasks_path()),
        },
        cove,
    );
    let auditor = ShadowAuditor::new(ledger.clone(), Arc::new(upstream.clone()));

    Ok(AppState {
        config,
        store,
        vault,
        ledger,
        resolver,
        machine,
        hydration,
        recall,
        upstream,
        auditor,
    })
}

/// The HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/user/code", post(user_code))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the proxy until shutdown. Bind or serve failures surface as errors
/// for the CLI to map onto exit codes.
pub async fn serve(config: Config) -> Result<()> {
    let port = config.port;
    let state = build_state(config).await?;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "tinymem proxy listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler");
    }
    info!("shutdown signal received");
}

//─────────────────────────────
//  Chat endpoint
//─────────────────────────────

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let project_id = headers
        .get("x-tinymem-project")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string();
    match run_chat_turn(&state, &project_id, body).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn run_chat_turn(
    state: &AppState,
    project_id: &str,
    mut body: serde_json::Value,
) -> Result<Response> {
    if !body.is_object() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": {"message": "request body must be a JSON object"}
            })),
        )
            .into_response());
    }
    let user_prompt = extract_user_prompt(&body);
    let streaming = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let prompt_hash = state
        .vault
        .store(user_prompt.as_bytes(), ContentType::UserInput, None)
        .await?;
    let episode_id = state
        .ledger
        .create_episode(
            Some(&prompt_hash),
            None,
            Some(serde_json::json!({"source": "chat", "project_id": project_id})),
        )
        .await?;

    let hydration = match state.hydration.hydrate(episode_id, &user_prompt).await {
        Ok(hydration) => hydration,
        Err(e) => {
            warn!(error = %e, "hydration failed, continuing without");
            Hydration::default()
        }
    };
    let (recall, recall_status) = match state.recall.recall(project_id, &user_prompt, "chat").await
    {
        Ok(outcome) if outcome.memories.is_empty() => (outcome, RECALL_STATUS_NONE),
        Ok(outcome) => (outcome, RECALL_STATUS_INJECTED),
        Err(e) => {
            warn!(error = %e, "recall failed, continuing without");
            (RecallOutcome::default(), RECALL_STATUS_FAILED)
        }
    };

    enrich_request(state, &mut body, &hydration, &recall, &user_prompt);
    state
        .vault
        .store(
            serde_json::to_vec(&body["messages"])?.as_slice(),
            ContentType::Prompt,
            None,
        )
        .await?;

    if streaming {
        stream_turn(state, episode_id, body, user_prompt, &hydration, &recall, recall_status).await
    } else {
        complete_turn(state, episode_id, body, user_prompt, &recall, recall_status).await
    }
}

fn enrich_request(
    state: &AppState,
    body: &mut serde_json::Value,
    hydration: &Hydration,
    recall: &RecallOutcome,
    user_prompt: &str,
) {
    let mut injected = vec![serde_json::json!({"role": "system", "content": TOOL_POLICY})];
    if let Some(block) = hydration.system_message() {
        injected.push(serde_json::json!({"role": "system", "content": block}));
    }
    if let Some(block) = recall.render_block() {
        injected.push(serde_json::json!({"role": "system", "content": block}));
    }
    if state.config.always_include_user_prompt
        && injected.len() > 1
        && !user_prompt.is_empty()
    {
        injected.push(serde_json::json!({
            "role": "system",
            "content": format!("The user's current request: {user_prompt}")
        }));
    }

    let original = body
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();
    injected.extend(original);
    body["messages"] = serde_json::Value::Array(injected);
    body["model"] = serde_json::Value::String(state.config.upstream_model.clone());
}

async fn complete_turn(
    state: &AppState,
    episode_id: EpisodeId,
    body: serde_json::Value,
    user_prompt: String,
    recall: &RecallOutcome,
    recall_status: &'static str,
) -> Result<Response> {
    let upstream_response = match state.upstream.forward(&body).await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            return Ok(upstream_error_response(
                format!("upstream returned {}", response.status()),
                recall,
                recall_status,
            ))
        }
        Err(e) => return Ok(upstream_error_response(e.to_string(), recall, recall_status)),
    };

    let payload: serde_json::Value = upstream_response
        .json()
        .await
        .map_err(|e| TinyMemError::UpstreamUnreachable(format!("bad response body: {e}")))?;

    if let Some(assistant_text) = payload
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
    {
        if let Err(e) =
            turn::process_assistant_response(state, episode_id, &user_prompt, assistant_text)
                .await
        {
            warn!(error = %e, "post-turn processing failed");
        }
    }

    let mut response = Json(payload).into_response();
    apply_recall_headers(&mut response, recall, recall_status);
    Ok(response)
}

async fn stream_turn(
    state: &AppState,
    episode_id: EpisodeId,
    body: serde_json::Value,
    user_prompt: String,
    hydration: &Hydration,
    recall: &RecallOutcome,
    recall_status: &'static str,
) -> Result<Response> {
    let status_event = format!(
        "data: {}\n\n",
        serde_json::json!({
            "object": "tinymem.memory_status",
            "recall_count": recall.memories.len(),
            "recall_status": recall_status,
            "hydrated_entities": hydration.entity_keys(),
        })
    );

    let upstream_response = match state.upstream.forward(&body).await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            return Ok(stream_error_response(
                status_event,
                format!("upstream returned {}", response.status()),
                recall,
                recall_status,
            ))
        }
        Err(e) => {
            return Ok(stream_error_response(
                status_event,
                e.to_string(),
                recall,
                recall_status,
            ))
        }
    };

    let (tx, rx) = futures::channel::mpsc::unbounded::<std::result::Result<Bytes, io::Error>>();
    let _ = tx.unbounded_send(Ok(Bytes::from(status_event)));

    let collector = state.clone();
    tokio::spawn(async move {
        let mut collected: Vec<u8> = Vec::new();
        let mut chunks = upstream_response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    collected.extend_from_slice(&bytes);
                    if tx.unbounded_send(Ok(bytes)).is_err() {
                        // Client went away; keep draining so post-turn
                        // processing still sees the full response.
                        continue;
                    }
                }
                Err(e) => {
                    let _ = tx.unbounded_send(Err(io::Error::other(e)));
                    break;
                }
            }
        }
        drop(tx);

        if let Some(assistant_text) = turn::assemble_sse_text(&collected) {
            if let Err(e) = turn::process_assistant_response(
                &collector,
                episode_id,
                &user_prompt,
                &assistant_text,
            )
            .await
            {
                warn!(error = %e, "post-turn processing failed after stream");
            }
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(rx))
        .map_err(TinyMemError::storage)?;
    apply_recall_headers(&mut response, recall, recall_status);
    Ok(response)
}

//─────────────────────────────
//  User code endpoint
//─────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct UserCodeRequest {
    content: String,
    filepath: Option<String>,
}

async fn user_code(
    State(state): State<AppState>,
    Json(request): Json<UserCodeRequest>,
) -> Response {
    match turn::ingest_user_code(&state, &request.content, request.filepath.as_deref()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

//─────────────────────────────
//  Health endpoint
//─────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    let episodes = state.ledger.count_episodes().await;
    let artifacts = state.vault.count().await;
    match (episodes, artifacts) {
        (Ok(episodes), Ok(artifacts)) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "episodes": episodes,
            "artifacts": artifacts,
        }))
        .into_response(),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "store unavailable"})),
        )
            .into_response(),
    }
}

//─────────────────────────────
//  Shared response plumbing
//─────────────────────────────

fn apply_recall_headers(response: &mut Response, recall: &RecallOutcome, status: &'static str) {
    let headers = response.headers_mut();
    if let Ok(count) = recall.memories.len().to_string().parse() {
        headers.insert("X-TinyMem-Recall-Count", count);
    }
    if let Ok(value) = status.parse() {
        headers.insert("X-TinyMem-Recall-Status", value);
    }
}

fn upstream_error_response(
    message: String,
    recall: &RecallOutcome,
    recall_status: &'static str,
) -> Response {
    let mut response = (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({
            "error": {
                "message": format!(
                    "tinyMem could not reach the upstream model: {message}. The episode was \
                     recorded; retry when the upstream is available."
                ),
                "type": "upstream_unreachable",
            }
        })),
    )
        .into_response();
    apply_recall_headers(&mut response, recall, recall_status);
    response
}

fn stream_error_response(
    status_event: String,
    message: String,
    recall: &RecallOutcome,
    recall_status: &'static str,
) -> Response {
    let error_event = format!(
        "{status_event}data: {}\n\ndata: [DONE]\n\n",
        serde_json::json!({
            "error": {
                "message": format!("tinyMem could not reach the upstream model: {message}"),
                "type": "upstream_unreachable",
            }
        })
    );
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(Body::from(error_event))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    apply_recall_headers(&mut response, recall, recall_status);
    response
}

fn error_response(error: TinyMemError) -> Response {
    let status = match &error {
        TinyMemError::InvalidContentType(_) | TinyMemError::InvalidEntityKey(_) => {
            StatusCode::BAD_REQUEST
        }
        TinyMemError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({"error": {"message": error.to_string()}})),
    )
        .into_response()
}

/// The newest user-role message, as plain text. Multipart content arrays
/// contribute their text parts.
fn extract_user_prompt(body: &serde_json::Value) -> String {
    let Some(messages) = body.get("messages").and_then(|m| m.as_array()) else {
        return String::new();
    };
    for message in messages.iter().rev() {
        if message.get("role").and_then(|r| r.as_str()) != Some("user") {
            continue;
        }
        match message.get("content") {
            Some(serde_json::Value::String(text)) => return text.clone(),
            Some(serde_json::Value::Array(parts)) => {
                let text: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect();
                return text.join("\n");
            }
            _ => continue,
        }
    }
    String::new()
}
