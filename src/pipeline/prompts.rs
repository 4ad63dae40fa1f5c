//! Prompts and output schemas for each completion stage.

use kiln_common::{Artifact, ArtifactMode};
use serde_json::{Value, json};

use super::session::Plan;
use crate::oracle::{CompletionRequest, Stage};

const ANALYSIS_SYSTEM_PROMPT: &str = "You are analyzing a Solidity smart-contract system before it is \
rewritten in Compact for the Midnight network. Identify every contract, its state, its external \
entry points, access control, and cross-contract calls. Note anything that has no direct Compact \
equivalent (dynamic dispatch, unbounded loops, msg.value, inline assembly).";

const PLAN_SYSTEM_PROMPT: &str = "You are planning the Compact rewrite of an analyzed Solidity \
system. List the Compact contracts to produce, each with a stable PascalCase name, a one-line \
description and its responsibilities, and list the transactions (entry points) the rewrite must \
support together with the contracts each one touches.";

const GENERATION_SYSTEM_PROMPT: &str = "You are writing Compact code for the Midnight network. \
Produce complete, compilable contracts for the plan. Return a single `code` string when one \
contract suffices; otherwise return every planned contract under `contracts`, using exactly the \
planned names, plus deployment metadata describing deployment order and constructor arguments.";

const REPAIR_SYSTEM_PROMPT: &str = "You are fixing Compact contracts that failed to compile. \
Return ONLY the contracts listed below, under the same names. Make the smallest edit that fixes \
each reported error and leave everything else unchanged. Do not return contracts that are not \
listed.";

fn analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "contracts": {"type": "array", "items": {"type": "object"}},
            "concerns": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["summary"]
    })
}

fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "contracts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "description": {"type": "string"},
                        "responsibilities": {"type": "string"}
                    },
                    "required": ["name", "description", "responsibilities"]
                }
            },
            "transactions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "description": {"type": "string"},
                        "contracts": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["name"]
                }
            }
        },
        "required": ["contracts", "transactions"]
    })
}

fn contracts_schema() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "code": {"type": "string"},
                "role": {"type": "string"}
            },
            "required": ["name", "code"]
        }
    })
}

fn generation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "code": {"type": "string"},
            "contracts": contracts_schema(),
            "deployment": {"type": "object"}
        }
    })
}

fn repair_schema(mode: ArtifactMode) -> Value {
    match mode {
        ArtifactMode::Single => json!({
            "type": "object",
            "properties": {"code": {"type": "string"}},
            "required": ["code"]
        }),
        ArtifactMode::Multi => json!({
            "type": "object",
            "properties": {"contracts": contracts_schema()},
            "required": ["contracts"]
        }),
    }
}

fn pretty(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

pub fn analysis_request(source: &str) -> CompletionRequest {
    CompletionRequest {
        stage: Stage::Analysis,
        system_prompt: ANALYSIS_SYSTEM_PROMPT.to_string(),
        schema: analysis_schema(),
        user_message: format!("## Solidity source\n\n{}", source),
    }
}

pub fn plan_request(source: &str, analysis: &Value) -> CompletionRequest {
    CompletionRequest {
        stage: Stage::Plan,
        system_prompt: PLAN_SYSTEM_PROMPT.to_string(),
        schema: plan_schema(),
        user_message: format!(
            "## Analysis\n\n{}\n\n## Solidity source\n\n{}",
            pretty(analysis),
            source
        ),
    }
}

pub fn generation_request(source: &str, analysis: &Value, plan: &Plan) -> CompletionRequest {
    let contracts = pretty(&plan.contracts);
    let transactions = pretty(&plan.transactions);
    CompletionRequest {
        stage: Stage::Generate,
        system_prompt: GENERATION_SYSTEM_PROMPT.to_string(),
        schema: generation_schema(),
        user_message: format!(
            "## Planned contracts\n\n{}\n\n## Transactions\n\n{}\n\n## Analysis\n\n{}\n\n## Solidity source\n\n{}",
            contracts,
            transactions,
            pretty(analysis),
            source
        ),
    }
}

/// Ask for only the failing artifacts, each with its code and error.
pub fn repair_request(mode: ArtifactMode, batch: &[&Artifact]) -> CompletionRequest {
    let mut message = String::from("## Contracts to fix\n");
    for artifact in batch {
        message.push_str(&format!(
            "\n### {}\n\nError:\n```\n{}\n```\n\nCode:\n```compact\n{}\n```\n",
            artifact.name,
            artifact
                .validation_error
                .as_deref()
                .unwrap_or("validation failed"),
            artifact.code
        ));
    }
    if mode == ArtifactMode::Single {
        message.push_str("\nReturn the fixed contract as a single `code` string.\n");
    }
    CompletionRequest {
        stage: Stage::Repair,
        system_prompt: REPAIR_SYSTEM_PROMPT.to_string(),
        schema: repair_schema(mode),
        user_message: message,
    }
}
