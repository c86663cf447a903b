// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod manager;
mod schema;
mod step;

pub use manager::{PlanError, PlanManager};
pub use schema::{
    plan_schema, plan_tool_spec, PlanResponse, PlanValidator, ValidationFailure, PLAN_TOOL_NAME,
};
pub use step::{
    CommandDraft, PlanObservationPayload, PlanStep, StepObservation, StepStatus, AGENT_SHELL,
    STREAM_CAP_BYTES,
};
