//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.wabridge/config.json`) and environment.
//! Every field has a default so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP gateway settings (webhooks, proactive send, health).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Which messaging transport to run and its credentials.
    #[serde(default)]
    pub transport: TransportConfig,

    /// External reply program.
    #[serde(default)]
    pub responder: ResponderConfig,

    /// Where status, pairing payload and audit log are written.
    #[serde(default)]
    pub state: StateConfig,

    /// Canned replies sent when the responder fails.
    #[serde(default)]
    pub replies: RepliesConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 5001).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings for the send endpoints. When absent, no auth (loopback only).
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require a bearer token on send endpoints.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for the send endpoints. Overridden by WABRIDGE_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require `Authorization: Bearer <token>` on send endpoints.
    Token,
}

fn default_gateway_port() -> u16 {
    5001
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Which transport carries the WhatsApp session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A separate WhatsApp Web session process that pushes events to `/sidecar/events`.
    #[default]
    Sidecar,
    /// Twilio WhatsApp API: webhook inbound, REST outbound.
    Twilio,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub sidecar: SidecarConfig,
}

/// Twilio credentials. Each field is overridden by its env var when set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwilioConfig {
    /// Overridden by TWILIO_ACCOUNT_SID.
    pub account_sid: Option<String>,
    /// Overridden by TWILIO_AUTH_TOKEN.
    pub auth_token: Option<String>,
    /// Sender number, e.g. "whatsapp:+14155238886". Overridden by TWILIO_WHATSAPP_NUMBER.
    pub from_number: Option<String>,
}

/// Sidecar session process settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarConfig {
    /// URL the sidecar exposes for outbound messages; receives POST `{to, message}`.
    pub send_url: Option<String>,
    /// When set, `/sidecar/events` requires a matching `X-Sidecar-Secret` header.
    pub secret: Option<String>,
}

/// External reply program: invoked as `program args... <text> <senderId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponderConfig {
    #[serde(default = "default_responder_program")]
    pub program: String,
    /// Arguments placed before the message text and sender id.
    #[serde(default = "default_responder_args")]
    pub args: Vec<String>,
    /// Working directory for the program. Relative paths resolve against the config directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment, merged over the inherited environment.
    #[serde(default = "default_responder_env")]
    pub env: BTreeMap<String, String>,
    /// Seconds before the program is killed and treated as failed. `null` disables the bound.
    #[serde(default = "default_responder_timeout_secs")]
    pub timeout_secs: Option<u64>,
}

fn default_responder_program() -> String {
    "python3".to_string()
}

fn default_responder_args() -> Vec<String> {
    vec!["process_message.py".to_string()]
}

fn default_responder_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
    env
}

fn default_responder_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            program: default_responder_program(),
            args: default_responder_args(),
            working_dir: None,
            env: default_responder_env(),
            timeout_secs: default_responder_timeout_secs(),
        }
    }
}

impl ResponderConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// File locations for state read by external monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateConfig {
    /// Base directory for the files below (default: the config file's parent).
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    #[serde(default = "default_pairing_file")]
    pub pairing_file: PathBuf,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

fn default_status_file() -> PathBuf {
    PathBuf::from("bot_status.txt")
}

fn default_pairing_file() -> PathBuf {
    PathBuf::from("qr_code.txt")
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("message_logs.json")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: None,
            status_file: default_status_file(),
            pairing_file: default_pairing_file(),
            audit_log: default_audit_log(),
        }
    }
}

/// Fallback replies. Defaults are Indonesian, matching the audience of the reply program.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepliesConfig {
    /// Sent when the program ran but failed (non-zero exit, timeout, unreadable output).
    #[serde(default = "default_system_error")]
    pub system_error: String,
    /// Sent when the program could not be started at all.
    #[serde(default = "default_system_unavailable")]
    pub system_unavailable: String,
}

fn default_system_error() -> String {
    "Maaf, terjadi kesalahan sistem. Silakan coba lagi.".to_string()
}

fn default_system_unavailable() -> String {
    "Maaf, sistem sedang bermasalah. Silakan coba lagi nanti.".to_string()
}

impl Default for RepliesConfig {
    fn default() -> Self {
        Self {
            system_error: default_system_error(),
            system_unavailable: default_system_unavailable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Handle one sender's messages one at a time, in delivery order. Different senders still run concurrently.
    #[serde(default = "default_true")]
    pub serialize_per_sender: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            serialize_per_sender: true,
        }
    }
}

/// Read a non-empty, trimmed env var.
fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the gateway token: env WABRIDGE_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_nonempty("WABRIDGE_GATEWAY_TOKEN").or_else(|| trimmed(config.gateway.auth.token.as_ref()))
}

/// Twilio credentials after env overrides; None when any part is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

/// Resolve Twilio credentials: TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN and TWILIO_WHATSAPP_NUMBER override config.
pub fn resolve_twilio_credentials(config: &Config) -> Option<TwilioCredentials> {
    let t = &config.transport.twilio;
    let account_sid =
        env_nonempty("TWILIO_ACCOUNT_SID").or_else(|| trimmed(t.account_sid.as_ref()))?;
    let auth_token = env_nonempty("TWILIO_AUTH_TOKEN").or_else(|| trimmed(t.auth_token.as_ref()))?;
    let from_number =
        env_nonempty("TWILIO_WHATSAPP_NUMBER").or_else(|| trimmed(t.from_number.as_ref()))?;
    Some(TwilioCredentials {
        account_sid,
        auth_token,
        from_number,
    })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Base URL a local client uses to reach the gateway. Wildcard binds map to
/// loopback and IPv6 literals are bracketed.
pub fn gateway_base_url(config: &Config) -> String {
    let bind = config.gateway.bind.trim();
    let host = match bind.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) if ip.is_unspecified() => "127.0.0.1".to_string(),
        Ok(std::net::IpAddr::V6(ip)) if ip.is_unspecified() => "[::1]".to_string(),
        Ok(std::net::IpAddr::V6(ip)) => format!("[{}]", ip),
        Ok(std::net::IpAddr::V4(ip)) => ip.to_string(),
        Err(_) if bind.is_empty() => "127.0.0.1".to_string(),
        Err(_) => bind.to_string(),
    };
    format!("http://{}:{}", host, config.gateway.port)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WABRIDGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".wabridge").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, else the default path (or WABRIDGE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the state directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn resolve_against(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Resolve the state directory: `state.directory` if set (relative paths resolved against the config file's parent), otherwise the config file's parent.
pub fn resolve_state_dir(config: &Config, config_path: &Path) -> PathBuf {
    let parent = config_parent(config_path);
    match &config.state.directory {
        Some(d) if !d.as_os_str().is_empty() => resolve_against(parent, d),
        _ => parent.to_path_buf(),
    }
}

/// Absolute locations of the status, pairing and audit files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub status: PathBuf,
    pub pairing: PathBuf,
    pub audit_log: PathBuf,
}

pub fn resolve_state_paths(config: &Config, config_path: &Path) -> StatePaths {
    let dir = resolve_state_dir(config, config_path);
    StatePaths {
        status: resolve_against(&dir, &config.state.status_file),
        pairing: resolve_against(&dir, &config.state.pairing_file),
        audit_log: resolve_against(&dir, &config.state.audit_log),
    }
}

/// Resolve the responder working directory against the config file's parent. None => inherit the process cwd.
pub fn resolve_responder_dir(config: &Config, config_path: &Path) -> Option<PathBuf> {
    config
        .responder
        .working_dir
        .as_ref()
        .filter(|d| !d.as_os_str().is_empty())
        .map(|d| resolve_against(config_parent(config_path), d))
}
