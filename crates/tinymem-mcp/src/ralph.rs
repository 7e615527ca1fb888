//! `memory_ralph` – a bounded, evidence-gated repair loop.
//!
//! Ralph is a composed client of the core, not a core component: it reads
//! through recall, asks the upstream model for one next action, and may
//! only write through the evidence-gated fact path or as plain
//! observations. It cannot promote anything, cannot touch the entity map,
//! and stops at its iteration bound or on the first reply it cannot
//! interpret.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use tinymem_memory::NewMemory;
use tinymem_types::{EvidencePredicate, MemoryKind, Result, TinyMemError};
use tinymem_upstream::ChatBackend;

use crate::tools::{McpState, Tool};

/// Upper bound on loop iterations regardless of the caller's ask.
const MAX_ITERATIONS: u64 = 5;

const RALPH_SYSTEM_PROMPT: &str = "You drive one step of an evidence-gated repair loop over a \
project's memory. Given a goal and the current memory slice, answer with only a JSON object \
choosing exactly one action: {\"action\": \"verify\", \"predicate\": \"<type::content>\", \
\"summary\": \"<fact summary if it verifies>\"} to test a claim against the working tree \
(predicate types: file_exists, grep_hit, cmd_exit0, test_pass), {\"action\": \"note\", \
\"summary\": \"<observation>\"} to record an observation, or {\"action\": \"done\"} when the \
goal is satisfied or cannot be advanced.";

#[derive(Debug, Deserialize)]
struct RalphStep {
    action: String,
    #[serde(default)]
    predicate: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// The repair-loop tool.
pub struct MemoryRalph {
    backend: Arc<dyn ChatBackend>,
}

impl MemoryRalph {
    /// Build over an upstream backend.
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    async fn step(
        &self,
        state: &McpState,
        project_id: &str,
        goal: &str,
        history: &[serde_json::Value],
    ) -> Result<RalphStep> {
        let slice = state.recall.recall(project_id, goal, "ralph").await?;
        let memory_block = slice.render_block().unwrap_or_else(|| "(no memory)".to_string());
        let user = format!(
            "Goal: {goal}\n\nMemory:\n{memory_block}\n\nActions so far:\n{}",
            serde_json::to_string(history)?
        );
        let reply = self.backend.complete_text(RALPH_SYSTEM_PROMPT, &user).await?;
        parse_step(&reply)
    }
}

#[async_trait]
impl Tool for MemoryRalph {
    fn name(&self) -> &str {
        "memory_ralph"
    }

    fn description(&self) -> &str {
        "Run a bounded evidence-gated repair loop toward a goal. Every fact \
         it records passes the verifier; it can never promote or delete."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "string"},
                "goal": {"type": "string"},
                "max_iterations": {"type": "integer", "maximum": MAX_ITERATIONS},
            },
            "required": ["goal"]
        })
    }

    async fn call(&self, state: &McpState, args: serde_json::Value) -> Result<serde_json::Value> {
        let goal = args
            .get("goal")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TinyMemError::storage("goal is required"))?;
        let project_id = args
            .get("project_id")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();
        let iterations = args
            .get("max_iterations")
            .and_then(|v| v.as_u64())
            .unwrap_or(MAX_ITERATIONS)
            .min(MAX_ITERATIONS);

        let mut actions: Vec<serde_json::Value> = Vec::new();
        for iteration in 0..iterations {
            let step = match self.step(state, &project_id, goal, &actions).await {
                Ok(step) => step,
                Err(e) => {
                    warn!(error = %e, "ralph step failed, stopping loop");
                    actions.push(serde_json::json!({"action": "stopped", "error": e.to_string()}));
                    break;
                }
            };
            debug!(iteration, action = %step.action, "ralph step");

            match step.action.as_str() {
                "verify" => {
                    let (Some(raw), Some(summary)) = (&step.predicate, &step.summary) else {
                        actions.push(serde_json::json!({
                            "action": "stopped",
                            "error": "verify step missing predicate or summary",
                        }));
                        break;
                    };
                    let predicate = EvidencePredicate::parse(raw)?;
                    match state
                        .memory
                        .create_fact_with_evidence(
                            NewMemory::new(&project_id, MemoryKind::Fact, summary),
                            std::slice::from_ref(&predicate),
                            &state.verifier,
                        )
                        .await
                    {
                        Ok(fact) => actions.push(serde_json::json!({
                            "action": "verified",
                            "predicate": raw,
                            "fact_id": fact.id.to_string(),
                        })),
                        Err(TinyMemError::EvidenceUnverified { predicate }) => {
                            actions.push(serde_json::json!({
                                "action": "refuted",
                                "predicate": predicate,
                            }))
                        }
                        Err(e) => return Err(e),
                    }
                }
                "note" => {
                    let Some(summary) = &step.summary else {
                        break;
                    };
                    let note = state
                        .memory
                        .create(NewMemory::new(
                            &project_id,
                            MemoryKind::Observation,
                            summary,
                        ))
                        .await?;
                    actions.push(serde_json::json!({
                        "action": "noted",
                        "memory_id": note.id.to_string(),
                    }));
                }
                _ => break,
            }
        }

        Ok(serde_json::json!({
            "goal": goal,
            "iterations": actions.len(),
            "actions": actions,
        }))
    }
}

fn parse_step(reply: &str) -> Result<RalphStep> {
    let start = reply
        .find('{')
        .ok_or_else(|| TinyMemError::storage("ralph reply has no JSON"))?;
    let end = reply
        .rfind('}')
        .ok_or_else(|| TinyMemError::storage("ralph reply has no JSON"))?;
    serde_json::from_str(&reply[start..=end])
        .map_err(|e| TinyMemError::storage(format!("bad ralph step: {e}")))
}
