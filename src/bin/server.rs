use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use flowpilot::{
    providers::openai::{OpenAI, OpenAIConfig},
    FileStore, FlowDocument, FlowEdge, FlowEvent, FlowExecutor, FlowGraph, FlowNode,
    FlowRepository, LLMProvider, SettingsCipher, KNOWN_MODELS,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,flowpilot=debug,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = PathBuf::from(
        std::env::var("FLOWPILOT_DATA_DIR").unwrap_or_else(|_| "data".into()),
    );
    let addr: SocketAddr = std::env::var("FLOWPILOT_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3002".into())
        .parse()?;

    let store = Arc::new(FileStore::open(&data_dir).await?);
    let mut repository = FlowRepository::new(store.clone());
    if let Ok(secret) = std::env::var("FLOWPILOT_SECRET") {
        repository = repository.with_cipher(SettingsCipher::from_passphrase(&secret));
    }

    let app_state = Arc::new(AppState {
        repository,
        base_url: std::env::var("OPENAI_BASE_URL").ok(),
        organization: std::env::var("OPENAI_ORGANIZATION").ok(),
        project: std::env::var("OPENAI_PROJECT").ok(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/flows", get(list_flows).post(save_flow))
        .route("/api/flows/{id}", get(get_flow).put(update_flow).delete(delete_flow))
        .route("/api/flows/{id}/execute", post(execute_saved_flow))
        .route("/api/execute", post(execute_graph))
        .route(
            "/api/settings/{key}",
            get(get_setting).put(put_setting).delete(delete_setting),
        )
        .route("/api/probe", get(probe))
        .route("/api/models", get(list_models))
        .route("/api/schema", get(flow_schema))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    store.shutdown();
    tracing::info!("server stopped");
    Ok(())
}

struct AppState {
    repository: FlowRepository,
    base_url: Option<String>,
    organization: Option<String>,
    project: Option<String>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    success: bool,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        data,
        message: None,
        success: true,
    })
    .into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message.into()),
            success: false,
        }),
    )
        .into_response()
}

async fn list_flows(State(state): State<Arc<AppState>>) -> Response {
    match state.repository.list_flows().await {
        Ok(flows) => ok(flows),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to list flows: {e}")),
    }
}

async fn get_flow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.repository.get_flow(&id).await {
        Ok(Some(flow)) => ok(flow),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Flow not found"),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to read flow: {e}")),
    }
}

async fn save_flow(State(state): State<Arc<AppState>>, Json(flow): Json<FlowDocument>) -> Response {
    match state.repository.save_flow(flow).await {
        Ok(saved) => ok(saved),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to save flow: {e}")),
    }
}

async fn update_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut flow): Json<FlowDocument>,
) -> Response {
    flow.id = id;
    save_flow(State(state), Json(flow)).await
}

async fn delete_flow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.repository.delete_flow(&id).await {
        Ok(true) => ok(serde_json::json!({ "id": id })),
        Ok(false) => failure(StatusCode::NOT_FOUND, "Flow not found"),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to delete flow: {e}")),
    }
}

#[derive(Deserialize)]
struct SettingRequest {
    value: String,
    #[serde(default)]
    encrypted: bool,
}

async fn get_setting(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.repository.get_setting(&key).await {
        Ok(Some(value)) => ok(serde_json::json!({ "key": key, "value": value })),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Setting not found"),
        Err(e) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read setting: {e}"),
        ),
    }
}

async fn put_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(request): Json<SettingRequest>,
) -> Response {
    match state
        .repository
        .save_setting(&key, &request.value, request.encrypted)
        .await
    {
        Ok(()) => ok(serde_json::json!({ "key": key, "encrypted": request.encrypted })),
        Err(e) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save setting: {e}"),
        ),
    }
}

async fn delete_setting(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.repository.delete_setting(&key).await {
        Ok(true) => ok(serde_json::json!({ "key": key })),
        Ok(false) => failure(StatusCode::NOT_FOUND, "Setting not found"),
        Err(e) => failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to delete setting: {e}"),
        ),
    }
}

#[derive(Deserialize)]
struct ExecuteGraphRequest {
    #[serde(default)]
    nodes: Vec<FlowNode>,
    #[serde(default)]
    edges: Vec<FlowEdge>,
}

async fn execute_saved_flow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    match state.repository.get_flow(&id).await {
        Ok(Some(flow)) => stream_run(&state, &headers, flow.graph()),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Flow not found"),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to read flow: {e}")),
    }
}

async fn execute_graph(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ExecuteGraphRequest>,
) -> Response {
    stream_run(&state, &headers, FlowGraph::new(request.nodes, request.edges))
}

/// Starts the run in the background and relays its lifecycle events as SSE.
fn stream_run(state: &AppState, headers: &HeaderMap, graph: FlowGraph) -> Response {
    let provider = match provider_from_headers(state, headers) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    if let Err(e) = graph.execution_order() {
        return failure(StatusCode::BAD_REQUEST, format!("Invalid flow graph: {e}"));
    }

    let (sender, mut receiver) = mpsc::unbounded_channel::<FlowEvent>();
    tokio::spawn(async move {
        let executor = FlowExecutor::new(provider);
        if let Err(error) = executor.run(&graph, &sender).await {
            tracing::warn!(%error, "flow run aborted");
        }
    });

    let stream = async_stream::stream! {
        while let Some(event) = receiver.recv().await {
            yield Event::default().json_data(&event);
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn probe(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let provider = match provider_from_headers(&state, &headers) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    ok(serde_json::json!({ "valid": provider.probe().await }))
}

async fn list_models() -> Response {
    ok(KNOWN_MODELS)
}

async fn flow_schema() -> Response {
    ok(FlowDocument::json_schema())
}

fn provider_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Arc<dyn LLMProvider>, Response> {
    let Some(auth_header) = headers.get("Authorization") else {
        return Err(failure(StatusCode::UNAUTHORIZED, "Missing Authorization header"));
    };

    let Ok(auth_str) = auth_header.to_str() else {
        return Err(failure(StatusCode::BAD_REQUEST, "Invalid Authorization header"));
    };

    let Some(token) = auth_str.strip_prefix("Bearer ").filter(|token| !token.is_empty()) else {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            "Authorization header must be Bearer token",
        ));
    };

    let mut config = OpenAIConfig::new(token);
    if let Some(base_url) = &state.base_url {
        config = config.with_base_url(base_url.clone());
    }
    if let Some(organization) = &state.organization {
        config = config.with_organization(organization.clone());
    }
    if let Some(project) = &state.project {
        config = config.with_project(project.clone());
    }

    OpenAI::from_config(config)
        .map(|provider| Arc::new(provider) as Arc<dyn LLMProvider>)
        .map_err(|e| failure(StatusCode::BAD_REQUEST, format!("Failed to create provider: {e}")))
}
