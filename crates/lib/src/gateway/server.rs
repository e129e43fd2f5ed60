//! Gateway HTTP server (single port).

use crate::bridge::{build_transport, Bridge};
use crate::channels::{
    secret_matches, SidecarEvent, TransportEvent, TwilioWebhookForm, SIDECAR_SECRET_HEADER,
};
use crate::config::{self, Config, TransportKind};
use crate::gateway::protocol::{
    BroadcastEntry, BroadcastParams, BroadcastResult, Health, SendParams, SendResult,
};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Form, Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;

const SERVICE_NAME: &str = "wabridge";

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub bridge: Arc<Bridge>,
    /// When Some, send endpoints require `Authorization: Bearer <token>`.
    pub required_token: Option<String>,
    /// When Some, `/sidecar/events` requires a matching secret header.
    pub sidecar_secret: Option<String>,
}

impl GatewayState {
    pub fn new(config: &Config, bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            required_token: require_send_token(config),
            sidecar_secret: config
                .transport
                .sidecar
                .secret
                .clone()
                .filter(|s| !s.is_empty()),
        }
    }
}

/// When auth mode is token and a token is configured, returns it for send validation.
fn require_send_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    match &state.required_token {
        Some(expected) => bearer_token(headers) == Some(expected.as_str()),
        None => true,
    }
}

/// Build the router. Only the webhook of the configured transport kind is mounted.
pub fn router(state: GatewayState, kind: TransportKind) -> Router {
    let app = Router::new()
        .route("/", get(health_http))
        .route("/send", post(send_http))
        .route("/send-broadcast", post(send_broadcast_http));
    let app = match kind {
        TransportKind::Twilio => app.route("/twilio/webhook", post(twilio_webhook)),
        TransportKind::Sidecar => app.route("/sidecar/events", post(sidecar_events)),
    };
    app.with_state(state)
}

/// Run the gateway; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, token auth must be configured or startup fails.
/// Starts the bridge and blocks until shutdown (e.g. Ctrl+C), then stops the bridge.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or WABRIDGE_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let transport = build_transport(&config);
    let bridge = Arc::new(Bridge::from_config(&config, &config_path, transport));
    log::info!(
        "responder: {} {} (timeout {:?})",
        config.responder.program,
        config.responder.args.join(" "),
        config.responder.timeout()
    );

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    bridge.start()?;
    let app = router(GatewayState::new(&config, bridge.clone()), config.transport.kind);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited");
    bridge.stop().await;
    served?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping bridge");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<Health> {
    let lifecycle = match state.bridge.status().current().await {
        Ok(s) => s.map(|s| s.to_string()),
        Err(e) => {
            log::debug!("health: reading status failed: {}", e);
            None
        }
    };
    Json(Health {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        transport: state.bridge.transport_id().to_string(),
        lifecycle,
    })
}

/// POST /twilio/webhook: Twilio form post (From, Body). Always acknowledged unless the bridge is down.
async fn twilio_webhook(
    State(state): State<GatewayState>,
    Form(form): Form<TwilioWebhookForm>,
) -> (StatusCode, &'static str) {
    let Some(event) = form.into_event() else {
        return (StatusCode::OK, "OK");
    };
    match state.bridge.ingest(event).await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Error"),
    }
}

/// POST /sidecar/events: lifecycle and message events from the WhatsApp Web sidecar.
async fn sidecar_events(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(event): Json<SidecarEvent>,
) -> StatusCode {
    let provided = headers
        .get(SIDECAR_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if !secret_matches(state.sidecar_secret.as_deref(), provided) {
        return StatusCode::FORBIDDEN;
    }
    match state.bridge.ingest(TransportEvent::from(event)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// POST /send: proactive message to one recipient.
async fn send_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(params): Json<SendParams>,
) -> Result<Json<SendResult>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if params.to.trim().is_empty() || params.message.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let ok = state.bridge.send_message(params.to.trim(), &params.message).await;
    Ok(Json(SendResult { ok }))
}

/// POST /send-broadcast: the same message to each recipient, one after another.
async fn send_broadcast_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(params): Json<BroadcastParams>,
) -> Result<Json<BroadcastResult>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if params.message.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let mut results = Vec::with_capacity(params.phone_numbers.len());
    for phone in &params.phone_numbers {
        let sent = state.bridge.send_message(phone.trim(), &params.message).await;
        results.push(BroadcastEntry::new(phone.clone(), sent));
    }
    Ok(Json(BroadcastResult {
        status: "success".to_string(),
        results,
    }))
}
