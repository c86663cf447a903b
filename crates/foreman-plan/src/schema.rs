// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The plan tool contract and its argument validator.
//!
//! The planner sees exactly one tool.  Its arguments are a full plan
//! response: chat `message`, `reasoning` trace, the `plan` step array, and
//! the `requireHumanInput` pause flag.  Every tool call goes through
//! [`PlanValidator`] before the runtime acts on it; failures synthesize the
//! corrective feedback the planner needs to retry.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use foreman_model::{truncate_runes, ToolSpec};

use crate::step::{PlanObservationPayload, PlanStep};

/// Name under which the plan tool is exposed to the planner.
pub const PLAN_TOOL_NAME: &str = "open-agent";

/// Longest detail text included in validation feedback.
const DETAIL_RUNES: usize = 512;

/// Parsed, schema-valid plan tool arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanResponse {
    pub message: String,
    pub reasoning: Vec<String>,
    pub plan: Vec<PlanStep>,
    pub require_human_input: bool,
}

/// JSON Schema for the plan tool's arguments object.
pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "message": {
                "type": "string",
                "description": "Chat text shown to the user while the plan executes."
            },
            "reasoning": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Short reasoning notes, most recent last."
            },
            "plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string", "minLength": 1 },
                        "title": { "type": "string" },
                        "status": {
                            "type": "string",
                            "enum": ["pending", "completed", "failed", "abandoned"]
                        },
                        "waitingForId": {
                            "type": "array",
                            "items": { "type": "string" }
                        },
                        "command": {
                            "type": "object",
                            "properties": {
                                "shell": { "type": "string" },
                                "run": { "type": "string" },
                                "cwd": { "type": "string" },
                                "timeoutSec": { "type": "integer", "minimum": 0 },
                                "filterRegex": { "type": "string" },
                                "tailLines": { "type": "integer", "minimum": 0 },
                                "maxBytes": { "type": "integer", "minimum": 0 },
                                "reason": { "type": "string" }
                            },
                            "required": ["shell", "run"],
                            "additionalProperties": false
                        }
                    },
                    "required": ["id", "title", "command"],
                    "additionalProperties": false
                }
            },
            "requireHumanInput": {
                "type": "boolean",
                "description": "Pause and ask the user before continuing."
            }
        },
        "required": ["message", "plan"],
        "additionalProperties": false
    })
}

/// Tool description handed to the planner alongside the schema.
pub fn plan_tool_spec() -> ToolSpec {
    ToolSpec {
        name: PLAN_TOOL_NAME.into(),
        description: "Submit the next plan: a DAG of shell or internal commands. \
                      Steps whose waitingForId entries are all completed run in \
                      parallel. Echo completed steps from the previous plan with \
                      status \"completed\" so dependencies resolve. Set \
                      requireHumanInput when the user must answer before work \
                      can continue."
            .into(),
        parameters: plan_schema(),
    }
}

/// A rejected tool call, carrying everything needed to brief the planner.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{summary}")]
pub struct ValidationFailure {
    pub json_parse_error: bool,
    pub schema_validation_error: bool,
    pub summary: String,
    pub details: String,
}

impl ValidationFailure {
    /// Observation envelope appended to history as the tool-role critique.
    pub fn to_payload(&self) -> PlanObservationPayload {
        PlanObservationPayload {
            summary: self.summary.clone(),
            details: self.details.clone(),
            json_parse_error: self.json_parse_error,
            schema_validation_error: self.schema_validation_error,
            response_validation_error: true,
            ..Default::default()
        }
    }

    /// User-role auto-prompt asking the planner to retry.
    pub fn retry_prompt(&self) -> String {
        let details = truncate_runes(&self.details, DETAIL_RUNES);
        format!(
            "Your previous tool call was rejected: {}\n{}\n\
             Call {PLAN_TOOL_NAME} again with arguments that conform to the \
             tool's JSON schema.",
            self.summary, details
        )
    }
}

/// Compiled plan-schema validator.
///
/// Compilation happens once at startup; a schema that fails to compile is an
/// unrecoverable initialization error.
pub struct PlanValidator {
    compiled: jsonschema::Validator,
}

impl PlanValidator {
    pub fn new() -> anyhow::Result<Self> {
        let schema = plan_schema();
        let compiled = jsonschema::validator_for(&schema)
            .map_err(|e| anyhow::anyhow!("plan schema failed to compile: {e}"))?;
        Ok(Self { compiled })
    }

    /// Validate raw tool-call arguments.
    ///
    /// Stages, in order: trim and reject empty; JSON-parse; schema-validate;
    /// deserialize.  The first failing stage produces the failure flags the
    /// feedback protocol expects.
    pub fn validate(&self, arguments: &str) -> Result<PlanResponse, ValidationFailure> {
        let trimmed = arguments.trim();
        if trimmed.is_empty() {
            return Err(ValidationFailure {
                json_parse_error: true,
                schema_validation_error: false,
                summary: "the tool call carried no arguments".into(),
                details: "The arguments string was empty.".into(),
            });
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                return Err(ValidationFailure {
                    json_parse_error: true,
                    schema_validation_error: false,
                    summary: "the tool call arguments were not valid JSON".into(),
                    details: e.to_string(),
                })
            }
        };

        let issues: Vec<String> = self
            .compiled
            .iter_errors(&value)
            .map(|e| format!("{}: {e}", e.instance_path))
            .collect();
        if !issues.is_empty() {
            return Err(ValidationFailure {
                json_parse_error: false,
                schema_validation_error: true,
                summary: "the tool call arguments did not match the plan schema".into(),
                details: issues.join("; "),
            });
        }

        serde_json::from_value(value).map_err(|e| ValidationFailure {
            json_parse_error: false,
            schema_validation_error: true,
            summary: "the tool call arguments could not be decoded".into(),
            details: e.to_string(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
