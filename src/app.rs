use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    auth::require_panel_auth,
    config::Config,
    db::PgStore,
    dispatch::Dispatcher,
    error::{PanelError, PanelResult},
    phone::canonical_wa_id,
    reconcile::{ReconcileReport, Reconciler},
    store::{ConversationStore, MemoryStore},
    types::{now_iso, CreateConversationBody, SendMessageBody, SendTemplateBody},
    whatsapp::{verify_signature, CloudApiClient, MessagingApi},
};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ConversationStore>,
    pub dispatcher: Dispatcher,
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn ConversationStore>,
        api: Arc<dyn MessagingApi>,
    ) -> Arc<Self> {
        let dispatcher = Dispatcher::from_config(&config, store.clone(), api);
        let reconciler = Reconciler::from_config(&config, store.clone());
        Arc::new(Self {
            config,
            store,
            dispatcher,
            reconciler,
        })
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> PanelResult<impl IntoResponse> {
    Ok(Json(state.store.list_conversations().await?))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateConversationBody>,
) -> PanelResult<impl IntoResponse> {
    let wa_id = canonical_wa_id(&payload.wa_id, &state.config.country_code)?;
    let conversation = state
        .store
        .upsert_conversation(&wa_id, payload.name.as_deref(), &now_iso())
        .await?;
    info!(%wa_id, name = %conversation.name, "conversation created");
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn delete_conversation(
    Path(raw_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> PanelResult<impl IntoResponse> {
    let wa_id = canonical_wa_id(&raw_id, &state.config.country_code)?;
    if !state.store.delete_conversation(&wa_id).await? {
        return Err(PanelError::NotFound(format!("conversation {wa_id}")));
    }
    info!(%wa_id, "conversation deleted");
    Ok(Json(json!({ "deleted": true, "waId": wa_id })))
}

async fn get_messages(
    Path(raw_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> PanelResult<impl IntoResponse> {
    let wa_id = canonical_wa_id(&raw_id, &state.config.country_code)?;
    Ok(Json(state.store.list_messages(&wa_id).await?))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendMessageBody>,
) -> PanelResult<impl IntoResponse> {
    let outcome = state.dispatcher.send(&payload.wa_id, &payload.text).await?;
    Ok(Json(outcome))
}

async fn send_template(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendTemplateBody>,
) -> PanelResult<impl IntoResponse> {
    let outcome = state.dispatcher.send_template(&payload.wa_id).await?;
    Ok(Json(outcome))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(mode) = params.get("hub.mode") else {
        return (StatusCode::OK, "webhook active").into_response();
    };
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected = &state.config.verify_token;

    if mode == "subscribe" && !expected.is_empty() && &verify_token == expected {
        info!("webhook verified");
        return (StatusCode::OK, challenge).into_response();
    }

    warn!(%mode, "webhook verification rejected");
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&state.config.app_secret, signature_header, &body) {
        warn!("webhook delivery with invalid signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let report = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => state.reconciler.apply(&payload).await,
        Err(err) => {
            warn!(error = %err, "webhook body is not JSON, acknowledging anyway");
            ReconcileReport::default()
        }
    };

    let mut reply = json!(report);
    reply["received"] = json!(true);
    (StatusCode::OK, Json(reply)).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    let panel = Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/{wa_id}", delete(delete_conversation))
        .route("/api/messages/{wa_id}", get(get_messages))
        .route("/api/send", post(send_message))
        .route("/api/send-template", post(send_template))
        .fallback_service(ServeDir::new(&state.config.public_dir))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_panel_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .merge(panel)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Picks Postgres when a database is configured, the in-memory store otherwise.
pub async fn open_store(config: &Config) -> PanelResult<Arc<dyn ConversationStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            info!("connected to postgres, migrations applied");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no DATABASE_URL or POSTGRES_HOST set, history lives in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    if config.credentials.is_none() {
        warn!("WHATSAPP_TOKEN or WHATSAPP_PHONE_NUMBER_ID missing, sends will fail");
    }
    if config.verify_token.is_empty() {
        warn!("VERIFY_TOKEN not set, webhook verification will be rejected");
    }

    let store = open_store(&config).await?;
    let api: Arc<dyn MessagingApi> = Arc::new(CloudApiClient::from_config(&config));
    let port = config.port;
    let state = AppState::new(config, store, api);
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("wa-panel listening on http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
