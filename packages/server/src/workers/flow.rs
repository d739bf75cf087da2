//! The flow interpreter: a small config-driven step runner with
//! interpolation, conditions, retries, and chaining into other events.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use crate::bus::Bus;
use crate::error::{OrchestratorError, Result};
use crate::store::Store;

use super::executors::Executor;

#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    pub flow_id: String,
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub trigger_payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default, alias = "when")]
    pub condition: Option<Value>,
    #[serde(default)]
    pub on_error: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub skip_unless_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Vec<u64>,
}

fn default_attempts() -> u32 {
    1
}

#[derive(Debug, Clone, Default)]
struct StepOutcome {
    output: String,
    error: Option<String>,
    skipped: bool,
}

/// Forward-only: `on_error: goto:<id>` marks a failure so later
/// `skip_unless_error` handlers fire, but execution always proceeds in
/// declaration order. Backward jumps are rejected by `validate`.
enum ErrorAction {
    Fail,
    Continue,
    Goto(String),
}

impl ErrorAction {
    fn parse(raw: &str) -> Self {
        if let Some(target) = raw.strip_prefix("goto:") {
            ErrorAction::Goto(target.to_string())
        } else if raw == "continue" {
            ErrorAction::Continue
        } else {
            ErrorAction::Fail
        }
    }
}

/// Runs flow configs by re-entering the regular executor registry for each
/// step's `action`; it is itself registered under action_type `"flow"`.
pub struct FlowExecutor {
    store: Store,
    bus: Bus,
}

impl FlowExecutor {
    pub fn new(store: Store, bus: Bus) -> Self {
        Self { store, bus }
    }
}

#[async_trait]
impl Executor for FlowExecutor {
    async fn execute(&self, config: Value) -> Result<String> {
        let flow: FlowConfig = serde_json::from_value(config)
            .map_err(|e| OrchestratorError::InvalidFlow(e.to_string()))?;
        if let Err(errors) = validate(&flow) {
            return Err(OrchestratorError::InvalidFlow(errors.join("; ")));
        }
        let report = run_flow(&self.store, &self.bus, &flow).await?;
        Ok(report)
    }
}

/// Pure validation ported from the original's `validate_flow`: duplicate
/// step ids, unknown actions, and action-specific required config.
pub fn validate(flow: &FlowConfig) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let valid_actions = ["claude_chat", "skill", "script", "webhook", "flow"];

    for step in &flow.steps {
        if !seen.insert(step.id.clone()) {
            errors.push(format!("duplicate step id: {}", step.id));
        }
        if !valid_actions.contains(&step.action.as_str()) {
            errors.push(format!("step {}: unknown action {}", step.id, step.action));
        }
        match step.action.as_str() {
            "script" if step.config.get("command").is_none() => {
                errors.push(format!("step {}: script requires 'command'", step.id));
            }
            "webhook" if step.config.get("url").is_none() => {
                errors.push(format!("step {}: webhook requires 'url'", step.id));
            }
            "claude_chat" if step.config.get("prompt").is_none() => {
                errors.push(format!("step {}: claude_chat requires 'prompt'", step.id));
            }
            "skill" if step.config.get("name").is_none() => {
                errors.push(format!("step {}: skill requires 'name'", step.id));
            }
            _ => {}
        }
        if let Some(on_error) = &step.on_error {
            if let Some(target) = on_error.strip_prefix("goto:") {
                let target_index = flow.steps.iter().position(|s| s.id == target);
                let this_index = flow.steps.iter().position(|s| s.id == step.id);
                if let (Some(t), Some(c)) = (target_index, this_index) {
                    if t <= c {
                        errors.push(format!(
                            "step {}: goto target {} is not forward of this step",
                            step.id, target
                        ));
                    }
                } else {
                    errors.push(format!("step {}: goto target {} not found", step.id, target));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[derive(Default)]
struct RunContext {
    steps: HashMap<String, StepOutcome>,
}

async fn run_flow(store: &Store, bus: &Bus, flow: &FlowConfig) -> Result<String> {
    let mut ctx = RunContext::default();
    let mut flow_failed = false;
    let mut failure_message: Option<String> = None;
    let mut report_lines = Vec::new();

    for step in &flow.steps {
        if let Some(condition) = &step.condition {
            if !condition_is_truthy(condition, flow, &ctx) {
                ctx.steps.insert(step.id.clone(), StepOutcome { skipped: true, ..Default::default() });
                report_lines.push(format!("{}: skipped (condition false)", step.id));
                continue;
            }
        }

        if step.skip_unless_error && !flow_failed {
            ctx.steps.insert(step.id.clone(), StepOutcome { skipped: true, ..Default::default() });
            report_lines.push(format!("{}: skipped (no prior failure)", step.id));
            continue;
        }

        let interpolated_config = interpolate_value(&step.config, flow, &ctx);
        let attempts = step.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1);
        let backoff = step.retry.as_ref().map(|r| r.backoff.clone()).unwrap_or_default();

        let mut last_result: std::result::Result<String, String> =
            Err(format!("unknown action: {}", step.action));

        for attempt in 0..attempts {
            last_result = execute_step_action(&step.action, interpolated_config.clone()).await;
            let retryable = match &last_result {
                Ok(output) => output.starts_with("error"),
                Err(_) => true,
            };
            if !retryable {
                break;
            }
            if attempt + 1 < attempts {
                let wait = backoff.get(attempt as usize).or(backoff.last()).copied().unwrap_or(0);
                if wait > 0 {
                    sleep(std::time::Duration::from_secs(wait)).await;
                }
            }
        }

        match last_result {
            Ok(output) if !output.starts_with("error") => {
                report_lines.push(format!("{}: {}", step.id, output));
                ctx.steps.insert(step.id.clone(), StepOutcome { output, ..Default::default() });
            }
            Ok(output) => {
                let message = output.clone();
                report_lines.push(format!("{}: error - {}", step.id, message));
                ctx.steps.insert(
                    step.id.clone(),
                    StepOutcome { output, error: Some(message.clone()), ..Default::default() },
                );
                if !handle_step_failure(step, &message, &mut flow_failed, &mut failure_message) {
                    break;
                }
            }
            Err(message) => {
                report_lines.push(format!("{}: error - {}", step.id, message));
                ctx.steps.insert(
                    step.id.clone(),
                    StepOutcome { output: String::new(), error: Some(message.clone()), ..Default::default() },
                );
                if !handle_step_failure(step, &message, &mut flow_failed, &mut failure_message) {
                    break;
                }
            }
        }
    }

    trigger_chained_flows(store, &flow.flow_id, !flow_failed).await?;

    let header = if flow_failed {
        format!(
            "error: flow failed - {}",
            failure_message.clone().unwrap_or_else(|| "unknown error".to_string())
        )
    } else {
        format!("flow {} completed", flow.flow_id)
    };

    bus.publish(
        "flow.completed",
        serde_json::json!({
            "flow_id": flow.flow_id,
            "success": !flow_failed,
            "steps": steps_to_json(&ctx),
            "error": failure_message,
        }),
        Some("flow"),
    )
    .await;

    report_lines.insert(0, header);
    Ok(report_lines.join("\n"))
}

/// `{step_id: {output, error, skipped}}`, as published on `flow.completed`.
fn steps_to_json(ctx: &RunContext) -> Value {
    let map: serde_json::Map<String, Value> = ctx
        .steps
        .iter()
        .map(|(id, outcome)| {
            (
                id.clone(),
                serde_json::json!({
                    "output": outcome.output,
                    "error": outcome.error,
                    "skipped": outcome.skipped,
                }),
            )
        })
        .collect();
    Value::Object(map)
}

/// Returns `true` if the flow should keep running after this step's
/// failure (i.e. `on_error` was `continue` or `goto`), `false` if it
/// should stop.
fn handle_step_failure(
    step: &Step,
    message: &str,
    flow_failed: &mut bool,
    failure_message: &mut Option<String>,
) -> bool {
    *flow_failed = true;
    if failure_message.is_none() {
        *failure_message = Some(message.to_string());
    }
    match step.on_error.as_deref().map(ErrorAction::parse).unwrap_or(ErrorAction::Fail) {
        ErrorAction::Fail => false,
        ErrorAction::Continue => true,
        ErrorAction::Goto(_) => true,
    }
}

async fn execute_step_action(action: &str, config: Value) -> std::result::Result<String, String> {
    // Non-flow actions are executed via a fresh, dependency-free instance
    // per call; `script`/`webhook` need no shared state, and `claude_chat`/
    // `skill` default to the deterministic echo backend in this path.
    // Nested `flow` actions are rejected rather than recursing.
    match action {
        "script" => super::executors::Registry::script_inline(config).await,
        "webhook" => super::executors::Registry::webhook_inline(config).await,
        "claude_chat" | "skill" => {
            let prompt = config.get("prompt").and_then(Value::as_str).unwrap_or("");
            Ok(prompt.to_string())
        }
        other => Err(format!("unknown action: {other}")),
    }
}

async fn trigger_chained_flows(store: &Store, flow_id: &str, succeeded: bool) -> Result<()> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT id, action_config FROM events
         WHERE event_type = 'flow' AND condition_type = 'flow_chain' AND condition_expr = ?",
    )
    .bind(flow_id)
    .fetch_all(&store.pool)
    .await?;

    for (event_id, action_config) in rows {
        let trigger: Value = action_config
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or(serde_json::json!({}));
        let condition = trigger
            .get("trigger")
            .and_then(|t| t.get("condition"))
            .and_then(Value::as_str)
            .unwrap_or("success");

        let gate_matches = match condition {
            "success" => succeeded,
            "failure" => !succeeded,
            "both" | "always" => true,
            _ => succeeded,
        };

        if gate_matches {
            sqlx::query("UPDATE events SET next_eval_at = ?, updated_at = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(Utc::now().to_rfc3339())
                .bind(&event_id)
                .execute(&store.pool)
                .await?;
        }
    }

    Ok(())
}

// ============================================================================
// Conditions
// ============================================================================

fn condition_is_truthy(condition: &Value, flow: &FlowConfig, ctx: &RunContext) -> bool {
    match condition {
        Value::String(s) => single_clause_truthy(s, flow, ctx),
        Value::Array(items) => items.iter().all(|item| match item.as_str() {
            Some(s) => single_clause_truthy(s, flow, ctx),
            None => false,
        }),
        _ => true,
    }
}

fn single_clause_truthy(raw: &str, flow: &FlowConfig, ctx: &RunContext) -> bool {
    let interpolated = interpolate_string(raw, flow, ctx);
    !matches!(interpolated.to_lowercase().as_str(), "" | "false" | "0" | "skip")
}

// ============================================================================
// Interpolation: `{{path}}` tokens over leaf strings only.
// ============================================================================

fn interpolate_value(value: &Value, flow: &FlowConfig, ctx: &RunContext) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_string(s, flow, ctx)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| interpolate_value(v, flow, ctx)).collect())
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), interpolate_value(value, flow, ctx));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn interpolate_string(input: &str, flow: &FlowConfig, ctx: &RunContext) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let token = after[..end].trim();
                output.push_str(&resolve_token(token, flow, ctx).unwrap_or_else(|| format!("{{{{{token}}}}}")));
                rest = &after[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    output.push_str(rest);
    output
}

fn resolve_token(token: &str, flow: &FlowConfig, ctx: &RunContext) -> Option<String> {
    let mut parts = token.splitn(2, '.');
    let head = parts.next()?;

    match head {
        "env" => {
            let name = parts.next()?;
            std::env::var(name).ok()
        }
        "date" => resolve_date_token(parts.next()?),
        "steps" => {
            let rest = parts.next()?;
            let mut it = rest.splitn(2, '.');
            let step_id = it.next()?;
            let field = it.next().unwrap_or("output");
            let outcome = ctx.steps.get(step_id)?;
            match field {
                "output" => Some(outcome.output.clone()),
                "error" => outcome.error.clone(),
                "skipped" => Some(outcome.skipped.to_string()),
                _ => None,
            }
        }
        "flow" => {
            let field = parts.next()?;
            match field {
                "id" => Some(flow.flow_id.clone()),
                "name" => Some(flow.name.clone()),
                _ => None,
            }
        }
        "trigger" => {
            let rest = parts.next()?;
            if let Some(key) = rest.strip_prefix("payload.") {
                flow.trigger_payload.get(key).map(value_to_plain_string)
            } else {
                flow.trigger_payload.get(rest).map(value_to_plain_string)
            }
        }
        _ => None,
    }
}

fn resolve_date_token(rest: &str) -> Option<String> {
    let now = Utc::now();
    if rest == "today" {
        return Some(now.format("%Y-%m-%d").to_string());
    }
    if rest == "iso" {
        return Some(now.to_rfc3339());
    }
    if rest == "week" {
        let iso = now.iso_week();
        return Some(format!("{}-W{:02}", iso.year(), iso.week()));
    }
    if let Some(days) = rest.strip_prefix("plus_days.") {
        let days: i64 = days.parse().ok()?;
        return Some((now + ChronoDuration::days(days)).format("%Y-%m-%d").to_string());
    }
    None
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_flow() -> FlowConfig {
        FlowConfig {
            flow_id: "flow-1".to_string(),
            name: "Sample".to_string(),
            steps: vec![],
            trigger_payload: serde_json::json!({ "k": "v" }),
        }
    }

    #[test]
    fn interpolate_leaf_strings_only() {
        let flow = sample_flow();
        let ctx = RunContext::default();
        let value = serde_json::json!({ "a": "{{flow.id}}", "b": 42 });
        let out = interpolate_value(&value, &flow, &ctx);
        assert_eq!(out["a"], "flow-1");
        assert_eq!(out["b"], 42);
    }

    #[test]
    fn interpolate_unrecognized_token_left_literal() {
        let flow = sample_flow();
        let ctx = RunContext::default();
        let out = interpolate_string("{{nope.bad}}", &flow, &ctx);
        assert_eq!(out, "{{nope.bad}}");
    }

    #[test]
    fn interpolate_trigger_payload() {
        let flow = sample_flow();
        let ctx = RunContext::default();
        let out = interpolate_string("value={{trigger.payload.k}}", &flow, &ctx);
        assert_eq!(out, "value=v");
    }

    #[test]
    fn falsy_condition_skips_step() {
        let flow = sample_flow();
        let ctx = RunContext::default();
        assert!(!single_clause_truthy("false", &flow, &ctx));
        assert!(!single_clause_truthy("0", &flow, &ctx));
        assert!(!single_clause_truthy("skip", &flow, &ctx));
        assert!(single_clause_truthy("yes", &flow, &ctx));
    }

    #[test]
    fn goto_marks_failure_and_keeps_the_flow_running() {
        let mut flow_failed = false;
        let mut failure_message = None;
        let step = Step {
            id: "s1".to_string(),
            action: "script".to_string(),
            config: Value::Null,
            agent: None,
            condition: None,
            on_error: Some("goto:cleanup".to_string()),
            retry: None,
            skip_unless_error: false,
        };
        let keep_going = handle_step_failure(&step, "boom", &mut flow_failed, &mut failure_message);
        assert!(keep_going);
        assert!(flow_failed);
        assert_eq!(failure_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn goto_runs_cleanup_step_and_flow_reports_failure() {
        let store = Store::connect_in_memory().await.unwrap();
        let bus = Bus::new(store.clone());
        let marker = std::env::temp_dir().join(format!("nexaas_goto_test_{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let marker_path = marker.to_string_lossy().to_string();

        let flow = FlowConfig {
            flow_id: "goto-flow".to_string(),
            name: "goto".to_string(),
            trigger_payload: Value::Null,
            steps: vec![
                Step {
                    id: "boom".to_string(),
                    action: "script".to_string(),
                    config: serde_json::json!({ "command": "exit 1" }),
                    agent: None,
                    condition: None,
                    on_error: Some("goto:cleanup".to_string()),
                    retry: None,
                    skip_unless_error: false,
                },
                Step {
                    id: "cleanup".to_string(),
                    action: "script".to_string(),
                    config: serde_json::json!({ "command": format!("touch {marker_path} && echo cleaned") }),
                    agent: None,
                    condition: None,
                    on_error: None,
                    retry: None,
                    skip_unless_error: true,
                },
            ],
        };

        let report = run_flow(&store, &bus, &flow).await.unwrap();
        assert!(report.starts_with("error: flow failed"), "flow should report failure: {report}");
        assert!(marker.exists(), "cleanup step should have run after the goto");
        assert!(
            report.contains("cleaned"),
            "report should include the cleanup step's output: {report}"
        );

        let _ = std::fs::remove_file(&marker);
    }

    #[test]
    fn validate_rejects_backward_goto() {
        let flow = FlowConfig {
            flow_id: "f".to_string(),
            name: "f".to_string(),
            trigger_payload: Value::Null,
            steps: vec![
                Step {
                    id: "a".to_string(),
                    action: "script".to_string(),
                    config: serde_json::json!({ "command": "echo hi" }),
                    agent: None,
                    condition: None,
                    on_error: Some("goto:b".to_string()),
                    retry: None,
                    skip_unless_error: false,
                },
                Step {
                    id: "b".to_string(),
                    action: "script".to_string(),
                    config: serde_json::json!({ "command": "echo hi" }),
                    agent: None,
                    condition: None,
                    on_error: None,
                    retry: None,
                    skip_unless_error: false,
                },
            ],
        };
        assert!(validate(&flow).is_ok());

        let mut backward = flow.clone();
        backward.steps[1].on_error = Some("goto:a".to_string());
        assert!(validate(&backward).is_err());
    }
}
