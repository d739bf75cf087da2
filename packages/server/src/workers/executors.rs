//! The action-type registry and the four non-flow executors. Each
//! executor returns a plain string result; a result prefixed with "error"
//! (case-sensitive, lowercase) is a soft failure, a returned `Err` is a
//! fatal one. Both are treated as job failure by the worker loop.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;

use crate::bus::Bus;
use crate::error::{OrchestratorError, Result};
use crate::store::Store;

use super::flow::FlowExecutor;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, config: Value) -> Result<String>;
}

#[derive(Clone)]
pub struct Registry {
    executors: Arc<HashMap<&'static str, Arc<dyn Executor>>>,
}

impl Registry {
    pub fn new(store: Store, bus: Bus) -> Self {
        let mut executors: HashMap<&'static str, Arc<dyn Executor>> = HashMap::new();
        executors.insert("script", Arc::new(ScriptExecutor));
        executors.insert("webhook", Arc::new(WebhookExecutor));
        let chat_backend: Arc<dyn ChatBackend> = Arc::new(EchoChatBackend);
        executors.insert("claude_chat", Arc::new(ChatExecutor { backend: chat_backend.clone() }));
        executors.insert("skill", Arc::new(ChatExecutor { backend: chat_backend }));
        executors.insert("flow", Arc::new(FlowExecutor::new(store, bus)));
        Self { executors: Arc::new(executors) }
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(action_type).cloned()
    }

    /// Used by the flow interpreter to invoke `script`/`webhook` steps
    /// without needing a full registry handle.
    pub async fn script_inline(config: Value) -> std::result::Result<String, String> {
        ScriptExecutor.execute(config).await.map_err(|e| e.to_string())
    }

    pub async fn webhook_inline(config: Value) -> std::result::Result<String, String> {
        WebhookExecutor.execute(config).await.map_err(|e| e.to_string())
    }
}

/// Runs a shell command with a per-config timeout (default 60s), killing
/// it on expiry and returning a deterministic error string.
struct ScriptExecutor;

#[async_trait]
impl Executor for ScriptExecutor {
    async fn execute(&self, config: Value) -> Result<String> {
        let command = config
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::Other("script config missing 'command'".into()))?;
        let cwd = config.get("cwd").and_then(Value::as_str);
        let timeout_secs = config.get("timeout").and_then(Value::as_u64).unwrap_or(60);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn().map_err(|e| OrchestratorError::Other(format!("error: failed to spawn script: {e}")))?;

        match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(Ok(output)) => Ok(format!(
                "error: script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )),
            Ok(Err(e)) => Ok(format!("error: script failed to run: {e}")),
            Err(_) => Ok(format!("error: script timed out after {timeout_secs}s")),
        }
    }
}

/// Issues an HTTP request with a per-config timeout (default 30s).
struct WebhookExecutor;

#[async_trait]
impl Executor for WebhookExecutor {
    async fn execute(&self, config: Value) -> Result<String> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::Other("webhook config missing 'url'".into()))?;
        let method = config.get("method").and_then(Value::as_str).unwrap_or("GET");
        let timeout_secs = config.get("timeout").and_then(Value::as_u64).unwrap_or(30);
        let body = config.get("body").cloned();
        let headers = config.get("headers").and_then(Value::as_object);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| OrchestratorError::Other(e.to_string()))?;

        let mut request = client.request(
            method.parse().unwrap_or(reqwest::Method::GET),
            url,
        );
        if let Some(headers) = headers {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                response.text().await.or_else(|_| Ok(String::new()))
            }
            Ok(response) => Ok(format!("error: webhook returned status {}", response.status())),
            Err(e) => Ok(format!("error: webhook request failed: {e}")),
        }
    }
}

/// `claude_chat` and `skill` are opaque external collaborators in the
/// orchestrator core; this trait lets a real LLM integration be wired in
/// without the core depending on any particular SDK.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send(&self, prompt: &str) -> Result<String>;
}

struct EchoChatBackend;

#[async_trait]
impl ChatBackend for EchoChatBackend {
    async fn send(&self, prompt: &str) -> Result<String> {
        Ok(prompt.to_string())
    }
}

struct ChatExecutor {
    backend: Arc<dyn ChatBackend>,
}

#[async_trait]
impl Executor for ChatExecutor {
    async fn execute(&self, config: Value) -> Result<String> {
        let prompt = config.get("prompt").and_then(Value::as_str).unwrap_or("");
        self.backend.send(prompt).await
    }
}
