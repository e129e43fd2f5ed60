//! Responder gateway: produce a reply by running an external program.
//!
//! The program is invoked as `program args... <text> <senderId>` with no shell, so
//! message text is never interpreted. Its stdout is the reply, its stderr is a
//! diagnostic that goes to the operator log only. Every outcome resolves to a
//! [`GatewayResult`]; nothing here returns an error to the caller.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{RepliesConfig, ResponderConfig};

/// Input to the external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRequest {
    pub text: String,
    pub sender_id: String,
}

impl GatewayRequest {
    pub fn new(text: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender_id: sender_id.into(),
        }
    }
}

/// Why an invocation produced no genuine reply. The text is for operators, never for the end user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponderFailure {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("stdout is not valid UTF-8")]
    MalformedOutput,
    #[error("waiting for process failed: {0}")]
    Wait(String),
}

/// Which canned reply stands in for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    /// The program ran but did not produce a usable reply.
    SystemError,
    /// The program could not be started.
    SystemUnavailable,
}

impl ResponderFailure {
    pub fn fallback_kind(&self) -> FallbackKind {
        match self {
            ResponderFailure::Spawn { .. } => FallbackKind::SystemUnavailable,
            ResponderFailure::Exit { .. }
            | ResponderFailure::Timeout(_)
            | ResponderFailure::MalformedOutput
            | ResponderFailure::Wait(_) => FallbackKind::SystemError,
        }
    }
}

/// Outcome of one invocation: a reply or a failure, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayResult {
    /// Trimmed stdout of a successful run. Empty means "no reply warranted".
    Reply(String),
    Failure(ResponderFailure),
}

impl GatewayResult {
    /// The text to send back: the reply, the fallback for a failure, or None for an empty reply.
    pub fn effective_reply(&self, fallbacks: &FallbackReplies) -> Option<String> {
        match self {
            GatewayResult::Reply(text) if text.is_empty() => None,
            GatewayResult::Reply(text) => Some(text.clone()),
            GatewayResult::Failure(f) => Some(fallbacks.text_for(f.fallback_kind()).to_string()),
        }
    }
}

/// User-facing replies substituted for failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackReplies {
    pub system_error: String,
    pub system_unavailable: String,
}

impl FallbackReplies {
    pub fn text_for(&self, kind: FallbackKind) -> &str {
        match kind {
            FallbackKind::SystemError => &self.system_error,
            FallbackKind::SystemUnavailable => &self.system_unavailable,
        }
    }
}

impl Default for FallbackReplies {
    fn default() -> Self {
        RepliesConfig::default().into()
    }
}

impl From<RepliesConfig> for FallbackReplies {
    fn from(c: RepliesConfig) -> Self {
        Self {
            system_error: c.system_error,
            system_unavailable: c.system_unavailable,
        }
    }
}

/// Produces replies for inbound messages. Invocations are independent and may run concurrently.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Run one invocation. `timeout` of None waits indefinitely.
    async fn invoke(&self, req: &GatewayRequest, timeout: Option<Duration>) -> GatewayResult;
}

/// Runs the configured program once per request.
#[derive(Debug, Clone)]
pub struct ProcessResponder {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl ProcessResponder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Build from config; `working_dir` is the already-resolved directory.
    pub fn from_config(config: &ResponderConfig, working_dir: Option<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir,
            env: config.env.clone(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self, req: &GatewayRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&req.text)
            .arg(&req.sender_id)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Responder for ProcessResponder {
    async fn invoke(&self, req: &GatewayRequest, timeout: Option<Duration>) -> GatewayResult {
        log::debug!(
            "responder: running {} for {} (timeout {:?})",
            self.program,
            req.sender_id,
            timeout
        );
        let child = match self.command(req).spawn() {
            Ok(c) => c,
            Err(e) => {
                log::error!("responder: failed to start {}: {}", self.program, e);
                return GatewayResult::Failure(ResponderFailure::Spawn {
                    program: self.program.clone(),
                    reason: e.to_string(),
                });
            }
        };

        // Dropping the wait future drops the child, and kill_on_drop terminates it.
        let wait = child.wait_with_output();
        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(r) => r,
                Err(_) => {
                    log::warn!(
                        "responder: {} timed out after {:?} for {}, killed",
                        self.program,
                        limit,
                        req.sender_id
                    );
                    return GatewayResult::Failure(ResponderFailure::Timeout(limit));
                }
            },
            None => wait.await,
        };
        let output = match output {
            Ok(o) => o,
            Err(e) => {
                log::error!("responder: waiting for {} failed: {}", self.program, e);
                return GatewayResult::Failure(ResponderFailure::Wait(e.to_string()));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            log::error!(
                "responder: {} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
            return GatewayResult::Failure(ResponderFailure::Exit {
                code: output.status.code(),
                stderr,
            });
        }
        if !stderr.trim().is_empty() {
            log::warn!("responder: {} stderr: {}", self.program, stderr.trim());
        }
        match String::from_utf8(output.stdout) {
            Ok(stdout) => GatewayResult::Reply(stdout.trim().to_string()),
            Err(_) => {
                log::error!("responder: {} wrote non UTF-8 output", self.program);
                GatewayResult::Failure(ResponderFailure::MalformedOutput)
            }
        }
    }
}
