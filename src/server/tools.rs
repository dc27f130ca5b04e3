use super::AppState;
use crate::collections::Tenant;
use crate::domain::types::{FeedbackRating, ResumeLevel};
use crate::domain::{
    CheckpointFilter, CreateSkill, RecordRemediation, RemediationSearch, SaveCheckpoint,
    UpdateSkill,
};
use crate::error::{Error, Result};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Tools whose executions are idempotent reads; the dispatcher may retry
/// these once on an internal error.
pub fn is_read_only(tool: &str) -> bool {
    matches!(
        tool,
        "context_branch_status"
            | "context_list_branches"
            | "context_search"
            | "checkpoint_list"
            | "checkpoint_resume"
            | "remediation_search"
            | "skill_search"
            | "skill_get"
    )
}

fn schema(mut properties: Value, required: &[&str]) -> Value {
    let props = properties.as_object_mut().expect("schema properties");
    props.insert(
        "session_id".into(),
        json!({"type": "string", "description": "Agent session id"}),
    );
    props.insert(
        "project_path".into(),
        json!({"type": "string", "description": "Absolute project path"}),
    );
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Declared tool surface for `GET /mcp/tools/list`.
pub fn tool_list() -> Value {
    json!({ "tools": [
        {
            "name": "context_branch",
            "description": "Open a sub-trajectory (branch) for a scoped piece of work.",
            "inputSchema": schema(json!({
                "description": {"type": "string", "maxLength": 200},
                "prompt": {"type": "string"},
            }), &["description", "prompt", "project_path"]),
        },
        {
            "name": "context_return",
            "description": "Fold the active branch into a summary and return to the parent.",
            "inputSchema": schema(json!({
                "message": {"type": "string", "description": "Summary of the branch outcome"},
            }), &["message", "project_path"]),
        },
        {
            "name": "context_operation",
            "description": "Record one unit of work (file read, tool call, generated text) in the active branch.",
            "inputSchema": schema(json!({
                "type": {"type": "string"},
                "content": {"type": "string"},
                "token_count": {"type": "integer"},
                "succeeded": {"type": "boolean"},
            }), &["content", "project_path"]),
        },
        {
            "name": "context_branch_status",
            "description": "Current branch depth, token breakdown and context usage.",
            "inputSchema": schema(json!({}), &["project_path"]),
        },
        {
            "name": "context_list_branches",
            "description": "All branches of the session with status, tokens and timestamps.",
            "inputSchema": schema(json!({}), &["project_path"]),
        },
        {
            "name": "context_rollback",
            "description": "Discard every branch above the target; optionally rewind the target itself.",
            "inputSchema": schema(json!({
                "branch_id": {"type": "string"},
                "restore_state": {"type": "boolean"},
            }), &["branch_id", "project_path"]),
        },
        {
            "name": "session_end",
            "description": "Seal the session, auto-folding any branches still open.",
            "inputSchema": schema(json!({}), &["project_path"]),
        },
        {
            "name": "context_search",
            "description": "Search folded branch summaries and checkpoints, branch delta layered over main.",
            "inputSchema": schema(json!({
                "query": {"type": "string"},
                "limit": {"type": "integer"},
            }), &["query", "project_path"]),
        },
        {
            "name": "checkpoint_save",
            "description": "Persist a named snapshot of conversation state.",
            "inputSchema": schema(json!({
                "name": {"type": "string", "maxLength": 200},
                "summary": {"type": "string"},
                "context": {"type": "string"},
                "full_state": {"type": "string"},
                "token_count": {"type": "integer"},
                "metadata": {"type": "object"},
            }), &["name", "summary", "project_path"]),
        },
        {
            "name": "checkpoint_list",
            "description": "List checkpoints, optionally only auto-created or per session.",
            "inputSchema": schema(json!({
                "limit": {"type": "integer"},
                "auto_only": {"type": "boolean"},
            }), &["project_path"]),
        },
        {
            "name": "checkpoint_resume",
            "description": "Resume a checkpoint at summary, context or full granularity.",
            "inputSchema": schema(json!({
                "checkpoint_id": {"type": "string"},
                "resume_level": {"type": "string", "enum": ["summary", "context", "full"]},
            }), &["checkpoint_id", "project_path"]),
        },
        {
            "name": "remediation_record",
            "description": "Record an error→fix pattern.",
            "inputSchema": schema(json!({
                "title": {"type": "string", "maxLength": 200},
                "problem": {"type": "string"},
                "solution": {"type": "string"},
                "symptoms": {"type": "array", "items": {"type": "string"}},
                "root_cause": {"type": "string"},
                "code_diff": {"type": "string"},
                "category": {"type": "string", "enum": ["compile", "runtime", "test", "lint", "security", "performance", "other"]},
                "scope": {"type": "string", "enum": ["project", "team", "org"]},
                "tags": {"type": "array", "items": {"type": "string"}},
                "team_id": {"type": "string"},
                "owner_id": {"type": "string"},
            }), &["title", "problem", "solution", "project_path"]),
        },
        {
            "name": "remediation_search",
            "description": "Search remediations, optionally walking the project → team → org ladder.",
            "inputSchema": schema(json!({
                "query": {"type": "string"},
                "limit": {"type": "integer"},
                "min_confidence": {"type": "number"},
                "category": {"type": "string"},
                "scope": {"type": "string", "enum": ["project", "team", "org"]},
                "include_hierarchy": {"type": "boolean"},
                "team_id": {"type": "string"},
            }), &["query", "project_path"]),
        },
        {
            "name": "remediation_feedback",
            "description": "Rate a remediation; adjusts its Bayesian confidence.",
            "inputSchema": schema(json!({
                "id": {"type": "string"},
                "rating": {"type": "string", "enum": ["helpful", "not_helpful", "outdated"]},
                "comment": {"type": "string"},
            }), &["id", "rating", "project_path"]),
        },
        {
            "name": "skill_create",
            "description": "Create a reusable workflow template.",
            "inputSchema": schema(json!({
                "name": {"type": "string", "maxLength": 120},
                "description": {"type": "string"},
                "content": {"type": "string"},
                "category": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "prerequisites": {"type": "array", "items": {"type": "string"}},
                "expected_outcome": {"type": "string"},
            }), &["name", "description", "content", "project_path"]),
        },
        {
            "name": "skill_search",
            "description": "Search skills by similarity.",
            "inputSchema": schema(json!({
                "query": {"type": "string"},
                "limit": {"type": "integer"},
                "category": {"type": "string"},
            }), &["query", "project_path"]),
        },
        {
            "name": "skill_get",
            "description": "Fetch a skill by id.",
            "inputSchema": schema(json!({
                "id": {"type": "string"},
            }), &["id", "project_path"]),
        },
        {
            "name": "skill_update",
            "description": "Update a skill; bumps its version.",
            "inputSchema": schema(json!({
                "id": {"type": "string"},
                "name": {"type": "string"},
                "description": {"type": "string"},
                "content": {"type": "string"},
                "category": {"type": "string"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "prerequisites": {"type": "array", "items": {"type": "string"}},
                "expected_outcome": {"type": "string"},
            }), &["id", "project_path"]),
        },
        {
            "name": "skill_delete",
            "description": "Delete a skill.",
            "inputSchema": schema(json!({
                "id": {"type": "string"},
            }), &["id", "project_path"]),
        },
        {
            "name": "skill_record_usage",
            "description": "Record that a skill was used and whether it worked.",
            "inputSchema": schema(json!({
                "id": {"type": "string"},
                "succeeded": {"type": "boolean"},
            }), &["id", "project_path"]),
        },
    ]})
}

/// Execute one tool call. Validation errors surface as InvalidArgument;
/// everything here is already tenancy-scoped.
pub async fn dispatch(
    state: &AppState,
    tool: &str,
    args: &Value,
    tenant: &Tenant,
    session_id: &str,
    cancel: &CancellationToken,
) -> Result<Value> {
    match tool {
        "context_branch" => {
            let description = req_str(args, "description")?;
            let prompt = req_str(args, "prompt")?;
            let info = state
                .engine
                .open_branch(tenant, session_id, &description, &prompt)
                .await?;
            Ok(serde_json::to_value(info)?)
        }
        "context_return" => {
            let message = req_str(args, "message")?;
            let report = state
                .engine
                .fold(tenant, session_id, &message, cancel)
                .await?;
            Ok(serde_json::to_value(report)?)
        }
        "context_operation" => {
            let content = req_str(args, "content")?;
            let op_type = opt_str(args, "type").unwrap_or_else(|| "tool".to_string());
            let token_count = opt_usize(args, "token_count")?;
            let succeeded = opt_bool(args, "succeeded")?.unwrap_or(true);
            let report = state
                .engine
                .record_operation(
                    tenant,
                    session_id,
                    &op_type,
                    &content,
                    token_count,
                    succeeded,
                    cancel,
                )
                .await?;
            Ok(serde_json::to_value(report)?)
        }
        "context_branch_status" => {
            let status = state.engine.status(tenant, session_id).await?;
            Ok(serde_json::to_value(status)?)
        }
        "context_list_branches" => {
            let branches = state.engine.list_branches(tenant, session_id).await?;
            Ok(json!({ "branches": branches }))
        }
        "context_rollback" => {
            let branch_id = req_str(args, "branch_id")?;
            let restore_state = opt_bool(args, "restore_state")?.unwrap_or(false);
            let report = state
                .engine
                .rollback(tenant, session_id, &branch_id, restore_state)
                .await?;
            Ok(serde_json::to_value(report)?)
        }
        "session_end" => {
            let context_state = state.engine.end_session(tenant, session_id).await?;
            Ok(json!({ "sealed": true, "context_state": context_state }))
        }
        "context_search" => {
            let query = req_str(args, "query")?;
            let limit = opt_usize(args, "limit")?.unwrap_or(10);
            let branch_token = state.engine.active_branch_token(tenant, session_id).await?;
            let hits = state
                .checkpoints
                .search(tenant, branch_token.as_deref(), &query, limit)
                .await?;
            Ok(json!({ "results": hits }))
        }
        "checkpoint_save" => {
            let branch_token = state.engine.active_branch_token(tenant, session_id).await?;
            let checkpoint = state
                .checkpoints
                .save(
                    tenant,
                    SaveCheckpoint {
                        session_id: session_id.to_string(),
                        name: req_str(args, "name")?,
                        summary: req_str(args, "summary")?,
                        context: opt_str(args, "context").unwrap_or_default(),
                        full_state: opt_str(args, "full_state"),
                        token_count: opt_usize(args, "token_count")?,
                        threshold_at_save: None,
                        auto_created: false,
                        metadata: args.get("metadata").cloned().unwrap_or(Value::Null),
                        branch_token,
                    },
                )
                .await?;
            Ok(serde_json::to_value(checkpoint)?)
        }
        "checkpoint_list" => {
            let limit = opt_usize(args, "limit")?.unwrap_or(20);
            let branch_token = state.engine.active_branch_token(tenant, session_id).await?;
            let checkpoints = state
                .checkpoints
                .list(
                    tenant,
                    branch_token.as_deref(),
                    limit,
                    CheckpointFilter {
                        auto_only: opt_bool(args, "auto_only")?,
                        session_id: opt_str(args, "session_id"),
                    },
                )
                .await?;
            Ok(json!({ "checkpoints": checkpoints }))
        }
        "checkpoint_resume" => {
            let checkpoint_id = req_str(args, "checkpoint_id")?;
            let level = ResumeLevel::parse(
                &opt_str(args, "resume_level").unwrap_or_else(|| "summary".to_string()),
            )?;
            let branch_token = state.engine.active_branch_token(tenant, session_id).await?;
            let resumed = state
                .checkpoints
                .resume(tenant, branch_token.as_deref(), &checkpoint_id, level)
                .await?;
            Ok(json!({
                "checkpoint": resumed.checkpoint,
                "resume_level": resumed.level,
                "content": resumed.content,
                "token_count": resumed.token_count,
            }))
        }
        "remediation_record" => {
            let remediation = state
                .remediations
                .record(
                    tenant,
                    RecordRemediation {
                        session_id: session_id.to_string(),
                        title: req_str(args, "title")?,
                        problem: req_str(args, "problem")?,
                        solution: req_str(args, "solution")?,
                        symptoms: str_list(args, "symptoms")?,
                        root_cause: opt_str(args, "root_cause").unwrap_or_default(),
                        code_diff: opt_str(args, "code_diff"),
                        category: opt_str(args, "category").unwrap_or_else(|| "other".to_string()),
                        scope: opt_str(args, "scope").unwrap_or_else(|| "project".to_string()),
                        tags: str_list(args, "tags")?,
                        team_id: opt_str(args, "team_id"),
                        org_owner_id: opt_str(args, "owner_id"),
                    },
                )
                .await?;
            Ok(serde_json::to_value(remediation)?)
        }
        "remediation_search" => {
            let hits = state
                .remediations
                .search(
                    tenant,
                    RemediationSearch {
                        query: req_str(args, "query")?,
                        limit: opt_usize(args, "limit")?.unwrap_or(10),
                        min_confidence: opt_f64(args, "min_confidence")?,
                        category: opt_str(args, "category"),
                        scope: opt_str(args, "scope").unwrap_or_else(|| "project".to_string()),
                        include_hierarchy: opt_bool(args, "include_hierarchy")?.unwrap_or(false),
                        team_id: opt_str(args, "team_id"),
                    },
                )
                .await?;
            let results: Vec<Value> = hits
                .into_iter()
                .map(|h| {
                    json!({
                        "remediation": h.remediation,
                        "score": h.score,
                        "origin": h.origin,
                    })
                })
                .collect();
            Ok(json!({ "results": results }))
        }
        "remediation_feedback" => {
            let id = req_str(args, "id")?;
            let rating = FeedbackRating::parse(&req_str(args, "rating")?)?;
            if let Some(comment) = opt_str(args, "comment") {
                tracing::debug!("remediation {id} feedback comment: {comment}");
            }
            let updated = state.remediations.feedback(tenant, &id, rating).await?;
            Ok(json!({ "id": updated.id, "confidence": updated.confidence }))
        }
        "skill_create" => {
            let skill = state
                .skills
                .create(
                    tenant,
                    CreateSkill {
                        session_id: session_id.to_string(),
                        name: req_str(args, "name")?,
                        description: req_str(args, "description")?,
                        content: req_str(args, "content")?,
                        category: opt_str(args, "category"),
                        tags: str_list(args, "tags")?,
                        prerequisites: str_list(args, "prerequisites")?,
                        expected_outcome: opt_str(args, "expected_outcome"),
                    },
                )
                .await?;
            Ok(serde_json::to_value(skill)?)
        }
        "skill_search" => {
            let query = req_str(args, "query")?;
            let limit = opt_usize(args, "limit")?.unwrap_or(10);
            let hits = state
                .skills
                .search(tenant, &query, limit, opt_str(args, "category").as_deref())
                .await?;
            let results: Vec<Value> = hits
                .into_iter()
                .map(|h| json!({ "skill": h.skill, "score": h.score }))
                .collect();
            Ok(json!({ "results": results }))
        }
        "skill_get" => {
            let skill = state.skills.get(tenant, &req_str(args, "id")?).await?;
            Ok(serde_json::to_value(skill)?)
        }
        "skill_update" => {
            let id = req_str(args, "id")?;
            let skill = state
                .skills
                .update(
                    tenant,
                    &id,
                    UpdateSkill {
                        name: opt_str(args, "name"),
                        description: opt_str(args, "description"),
                        content: opt_str(args, "content"),
                        category: opt_str(args, "category"),
                        tags: opt_str_list(args, "tags")?,
                        prerequisites: opt_str_list(args, "prerequisites")?,
                        expected_outcome: opt_str(args, "expected_outcome"),
                    },
                )
                .await?;
            Ok(serde_json::to_value(skill)?)
        }
        "skill_delete" => {
            let deleted = state.skills.delete(tenant, &req_str(args, "id")?).await?;
            Ok(json!({ "deleted": deleted }))
        }
        "skill_record_usage" => {
            let id = req_str(args, "id")?;
            let succeeded = opt_bool(args, "succeeded")?.unwrap_or(true);
            let skill = state
                .skills
                .record_usage(tenant, session_id, &id, succeeded)
                .await?;
            Ok(json!({
                "id": skill.id,
                "usage_count": skill.usage_count,
                "success_count": skill.success_count,
                "confidence": skill.confidence,
            }))
        }
        other => Err(Error::invalid_argument(format!("unknown tool {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Argument extraction
// ---------------------------------------------------------------------------

fn req_str(args: &Value, key: &str) -> Result<String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(Error::invalid_argument(format!(
            "{key} must be non-empty"
        ))),
        Some(_) => Err(Error::invalid_argument(format!("{key} must be a string"))),
        None => Err(Error::invalid_argument(format!("missing required {key}"))),
    }
}

pub(super) fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
}

fn opt_bool(args: &Value, key: &str) -> Result<Option<bool>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::invalid_argument(format!("{key} must be a boolean"))),
    }
}

fn opt_usize(args: &Value, key: &str) -> Result<Option<usize>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(|n| Some(n as usize)).ok_or_else(|| {
            Error::invalid_argument(format!("{key} must be a non-negative integer"))
        }),
    }
}

fn opt_f64(args: &Value, key: &str) -> Result<Option<f64>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::invalid_argument(format!("{key} must be a number"))),
    }
}

fn str_list(args: &Value, key: &str) -> Result<Vec<String>> {
    Ok(opt_str_list(args, key)?.unwrap_or_default())
}

fn opt_str_list(args: &Value, key: &str) -> Result<Option<Vec<String>>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    Error::invalid_argument(format!("{key} must be an array of strings"))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(Error::invalid_argument(format!("{key} must be an array"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_list_declares_the_full_surface() {
        let list = tool_list();
        let names: Vec<&str> = list["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [
            "context_branch",
            "context_return",
            "context_branch_status",
            "context_list_branches",
            "context_rollback",
            "context_search",
            "checkpoint_save",
            "checkpoint_list",
            "checkpoint_resume",
            "remediation_record",
            "remediation_search",
            "remediation_feedback",
            "skill_create",
            "skill_search",
            "skill_get",
            "skill_update",
            "skill_delete",
            "skill_record_usage",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
        // Every schema carries the common inputs.
        for tool in list["tools"].as_array().unwrap() {
            let props = &tool["inputSchema"]["properties"];
            assert!(props.get("session_id").is_some());
            assert!(props.get("project_path").is_some());
        }
    }

    #[test]
    fn test_read_only_classification() {
        assert!(is_read_only("remediation_search"));
        assert!(is_read_only("context_branch_status"));
        assert!(!is_read_only("context_return"));
        assert!(!is_read_only("checkpoint_save"));
    }

    #[test]
    fn test_arg_extraction() {
        let args = json!({
            "title": "t",
            "empty": "  ",
            "limit": 5,
            "flag": true,
            "tags": ["a", "b"],
            "bad_tags": [1, 2],
        });
        assert_eq!(req_str(&args, "title").unwrap(), "t");
        assert!(req_str(&args, "empty").is_err());
        assert!(req_str(&args, "missing").is_err());
        assert_eq!(opt_usize(&args, "limit").unwrap(), Some(5));
        assert_eq!(opt_bool(&args, "flag").unwrap(), Some(true));
        assert_eq!(str_list(&args, "tags").unwrap(), vec!["a", "b"]);
        assert!(str_list(&args, "bad_tags").is_err());
        assert_eq!(str_list(&args, "missing").unwrap(), Vec::<String>::new());
    }
}
