use std::{collections::HashMap, env, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::advisor::OpenAiAdvisor;
use crate::broadcast::WsBroadcaster;
use crate::channel::{ChannelAdapter, MessengerAdapter, WhatsAppAdapter};
use crate::engine::RoutingEngine;
use crate::error::EngineError;
use crate::presence::PresenceRegistry;
use crate::store::{AgentDirectory, PgConversationStore};
use crate::types::{
    AgentProfile, AssignBody, AssignTeamBody, Channel, ChannelConfig, ChannelConfigs,
    EventEnvelopeIn, SendMessageBody,
};

pub struct AppState {
    pub engine: Arc<RoutingEngine>,
    pub directory: Arc<dyn AgentDirectory>,
    pub presence: Arc<PresenceRegistry>,
    pub broadcaster: Arc<WsBroadcaster>,
    pub adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "inbox".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

fn channel_configs_from_env() -> ChannelConfigs {
    let mut configs = ChannelConfigs::new();
    let whatsapp_company = env_or_default("WHATSAPP_COMPANY_ID", "");
    if !whatsapp_company.is_empty() {
        configs.insert(
            Channel::Whatsapp,
            ChannelConfig {
                access_token: env_or_default("WHATSAPP_ACCESS_TOKEN", ""),
                phone_number_id: env_or_default("WHATSAPP_PHONE_NUMBER_ID", ""),
                page_id: String::new(),
                app_secret: env_or_default("WHATSAPP_APP_SECRET", ""),
                verify_token: env_or_default("WHATSAPP_VERIFY_TOKEN", ""),
                company_id: whatsapp_company,
            },
        );
    }
    let messenger_company = env_or_default("MESSENGER_COMPANY_ID", "");
    if !messenger_company.is_empty() {
        configs.insert(
            Channel::Messenger,
            ChannelConfig {
                access_token: env_or_default("MESSENGER_ACCESS_TOKEN", ""),
                phone_number_id: String::new(),
                page_id: env_or_default("MESSENGER_PAGE_ID", ""),
                app_secret: env_or_default("MESSENGER_APP_SECRET", ""),
                verify_token: env_or_default("MESSENGER_VERIFY_TOKEN", ""),
                company_id: messenger_company,
            },
        );
    }
    configs
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

async fn auth_agent_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AgentProfile, (StatusCode, Json<Value>)> {
    let token = bearer_token(headers).ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing bearer token" })),
    ))?;
    let profile = state
        .directory
        .find_agent_by_token(&token)
        .await
        .map_err(|err| {
            error!(error = %err, "token lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "auth lookup failed" })),
            )
        })?;
    profile.ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token" })),
    ))
}

fn engine_error_response(err: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::ConversationClosed { .. }
        | EngineError::ConversationAlreadyAssigned { .. } => StatusCode::CONFLICT,
        EngineError::ChannelSendFailed { .. } => StatusCode::BAD_GATEWAY,
        EngineError::ChannelNotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

async fn authorize_conversation(
    state: &Arc<AppState>,
    agent: &AgentProfile,
    conversation_id: &str,
) -> Result<(), (StatusCode, Json<Value>)> {
    let conversation = state
        .engine
        .store()
        .get_conversation(conversation_id)
        .await
        .map_err(engine_error_response)?;
    if conversation.company_id != agent.company_id {
        return Err(engine_error_response(EngineError::Unauthorized {
            company_id: conversation.company_id,
        }));
    }
    Ok(())
}

async fn webhook_verify(
    Path(channel): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(adapter) = Channel::parse(&channel).and_then(|c| state.adapters.get(&c)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "channel not found" })),
        )
            .into_response();
    };

    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    match adapter.verify_handshake(&mode, &verify_token, &challenge) {
        Some(echo) => (StatusCode::OK, echo).into_response(),
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook verification token" })),
        )
            .into_response(),
    }
}

async fn webhook_event(
    Path(channel): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(adapter) = Channel::parse(&channel).and_then(|c| state.adapters.get(&c)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "channel not found" })),
        )
            .into_response();
    };

    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !adapter.verify_signature(signature_header, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let (inbound, statuses) = adapter.parse_events(&payload);

    let mut processed = 0usize;
    for event in inbound {
        match state.engine.process_inbound(event).await {
            Ok(_) => processed += 1,
            // Non-2xx makes the provider redeliver; the dedup check absorbs
            // whatever was already persisted.
            Err(err) => {
                error!(error = %err, "inbound processing failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "inbound processing failed" })),
                )
                    .into_response();
            }
        }
    }
    for status in statuses {
        if let Err(err) = state
            .engine
            .process_status_update(status.channel, &status.provider_message_id, status.new_status)
            .await
        {
            warn!(error = %err, "status update failed");
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "received": true, "processed": processed })),
    )
        .into_response()
}

async fn get_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = match auth_agent_from_headers(&state, &headers).await {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    match state.engine.store().list_conversations(&agent.company_id).await {
        Ok(conversations) => (StatusCode::OK, Json(json!(conversations))).into_response(),
        Err(err) => engine_error_response(err).into_response(),
    }
}

async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = match auth_agent_from_headers(&state, &headers).await {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if let Err(resp) = authorize_conversation(&state, &agent, &conversation_id).await {
        return resp.into_response();
    }
    match state
        .engine
        .store()
        .get_recent_messages(&conversation_id, 200)
        .await
    {
        Ok(messages) => (StatusCode::OK, Json(json!(messages))).into_response(),
        Err(err) => engine_error_response(err).into_response(),
    }
}

async fn post_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    let agent = match auth_agent_from_headers(&state, &headers).await {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if let Err(resp) = authorize_conversation(&state, &agent, &conversation_id).await {
        return resp.into_response();
    }
    let text = body.text.trim();
    if text.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response();
    }
    match state
        .engine
        .send_message(&conversation_id, text, &agent.id, &agent.name)
        .await
    {
        Ok(message) => (StatusCode::OK, Json(json!(message))).into_response(),
        Err(err) => engine_error_response(err).into_response(),
    }
}

async fn assign_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AssignBody>,
) -> impl IntoResponse {
    let agent = match auth_agent_from_headers(&state, &headers).await {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if let Err(resp) = authorize_conversation(&state, &agent, &conversation_id).await {
        return resp.into_response();
    }
    let assignee = body.agent_id.unwrap_or_else(|| agent.id.clone());
    match state
        .engine
        .assign_conversation(&conversation_id, &assignee)
        .await
    {
        Ok(conversation) => (StatusCode::OK, Json(json!(conversation))).into_response(),
        Err(err) => engine_error_response(err).into_response(),
    }
}

async fn assign_team(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AssignTeamBody>,
) -> impl IntoResponse {
    let agent = match auth_agent_from_headers(&state, &headers).await {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if let Err(resp) = authorize_conversation(&state, &agent, &conversation_id).await {
        return resp.into_response();
    }
    let team = match state.directory.get_team(&body.team_id).await {
        Ok(Some(team)) if team.company_id == agent.company_id => team,
        Ok(_) => {
            return engine_error_response(EngineError::not_found("team", body.team_id))
                .into_response()
        }
        Err(err) => return engine_error_response(err).into_response(),
    };
    match state.engine.assign_team(&conversation_id, &team.id).await {
        Ok(conversation) => (StatusCode::OK, Json(json!(conversation))).into_response(),
        Err(err) => engine_error_response(err).into_response(),
    }
}

async fn unassign_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = match auth_agent_from_headers(&state, &headers).await {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if let Err(resp) = authorize_conversation(&state, &agent, &conversation_id).await {
        return resp.into_response();
    }
    match state.engine.unassign_conversation(&conversation_id).await {
        Ok(conversation) => (StatusCode::OK, Json(json!(conversation))).into_response(),
        Err(err) => engine_error_response(err).into_response(),
    }
}

async fn archive_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = match auth_agent_from_headers(&state, &headers).await {
        Ok(agent) => agent,
        Err(resp) => return resp.into_response(),
    };
    if let Err(resp) = authorize_conversation(&state, &agent, &conversation_id).await {
        return resp.into_response();
    }
    match state.engine.archive_conversation(&conversation_id).await {
        Ok(conversation) => (StatusCode::OK, Json(json!(conversation))).into_response(),
        Err(err) => engine_error_response(err).into_response(),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = state.presence.register(tx).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "agent:join" => {
                let token = envelope
                    .data
                    .get("token")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let profile = state
                    .directory
                    .find_agent_by_token(&token)
                    .await
                    .ok()
                    .flatten();
                let Some(profile) = profile else {
                    state
                        .broadcaster
                        .push_to_connection(
                            connection_id,
                            "auth:error",
                            json!({ "message": "invalid agent token" }),
                        )
                        .await;
                    continue;
                };

                state
                    .presence
                    .authenticate(
                        connection_id,
                        &profile.id,
                        &profile.company_id,
                        profile.team_ids.iter().cloned().collect(),
                    )
                    .await;

                match state
                    .engine
                    .store()
                    .list_conversations(&profile.company_id)
                    .await
                {
                    Ok(conversations) => {
                        state
                            .broadcaster
                            .push_to_connection(
                                connection_id,
                                "conversation:snapshot",
                                json!(conversations),
                            )
                            .await;
                    }
                    Err(err) => warn!(error = %err, "snapshot load failed"),
                }
            }
            "conversation:watch" => {
                let Some(agent) = state.presence.agent_for(connection_id).await else {
                    continue;
                };
                let Some(conversation_id) =
                    envelope.data.get("conversationId").and_then(Value::as_str)
                else {
                    continue;
                };
                let Ok(conversation) =
                    state.engine.store().get_conversation(conversation_id).await
                else {
                    continue;
                };
                if conversation.company_id != agent.company_id {
                    continue;
                }
                if let Ok(messages) = state
                    .engine
                    .store()
                    .get_recent_messages(conversation_id, 200)
                    .await
                {
                    state
                        .broadcaster
                        .push_to_connection(
                            connection_id,
                            "conversation:history",
                            json!({ "conversationId": conversation_id, "messages": messages }),
                        )
                        .await;
                }
            }
            "agent:message" => {
                let Some(agent) = state.presence.agent_for(connection_id).await else {
                    state
                        .broadcaster
                        .push_to_connection(
                            connection_id,
                            "auth:error",
                            json!({ "message": "join before sending" }),
                        )
                        .await;
                    continue;
                };
                let conversation_id = envelope.data.get("conversationId").and_then(Value::as_str);
                let text = envelope.data.get("text").and_then(Value::as_str);
                let (Some(conversation_id), Some(text)) = (conversation_id, text) else {
                    continue;
                };
                // The profile map only carries ids over the socket; display
                // names are resolved at join via the directory.
                let sender_name = envelope
                    .data
                    .get("senderName")
                    .and_then(Value::as_str)
                    .unwrap_or(agent.user_id.as_str());
                if let Err(err) = state
                    .engine
                    .send_message(conversation_id, text, &agent.user_id, sender_name)
                    .await
                {
                    state
                        .broadcaster
                        .push_to_connection(
                            connection_id,
                            "error",
                            json!({ "conversationId": conversation_id, "message": err.to_string() }),
                        )
                        .await;
                }
            }
            _ => {}
        }
    }

    state.presence.purge(connection_id).await;
    send_task.abort();
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{channel}", get(webhook_verify).post(webhook_event))
        .route("/api/conversations", get(get_conversations))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_messages).post(post_message),
        )
        .route(
            "/api/conversations/{conversation_id}/assign",
            post(assign_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/team",
            post(assign_team),
        )
        .route(
            "/api/conversations/{conversation_id}/unassign",
            post(unassign_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/archive",
            post(archive_conversation),
        )
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let http_client = reqwest::Client::new();
    let store = Arc::new(PgConversationStore::new(db));
    let directory: Arc<dyn AgentDirectory> = store.clone();

    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    for (channel, config) in channel_configs_from_env() {
        let adapter: Arc<dyn ChannelAdapter> = match channel {
            Channel::Whatsapp => Arc::new(WhatsAppAdapter::new(http_client.clone(), config)),
            Channel::Messenger => Arc::new(MessengerAdapter::new(http_client.clone(), config)),
        };
        info!(channel = channel.as_str(), "channel adapter configured");
        adapters.insert(channel, adapter);
    }

    let advisor = Arc::new(OpenAiAdvisor::new(
        http_client,
        directory.clone(),
        env_or_default("OPENAI_API_KEY", ""),
        env_or_default("OPENAI_MODEL", "gpt-4o-mini"),
        env_or_default("BOT_NAME", "Support Bot"),
        env_secs("ADVISOR_TIMEOUT_SECS", 20),
    ));

    let presence = Arc::new(PresenceRegistry::new());
    let broadcaster = Arc::new(WsBroadcaster::new(presence.clone()));
    let engine = Arc::new(RoutingEngine::new(
        store,
        advisor,
        broadcaster.clone(),
        adapters.clone(),
        env_secs("SEND_TIMEOUT_SECS", 15),
    ));

    let state = Arc::new(AppState {
        engine,
        directory,
        presence,
        broadcaster,
        adapters,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("inbox server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
