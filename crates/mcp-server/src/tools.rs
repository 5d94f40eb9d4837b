//! Tool surface: catalog, schemas, and handlers.
//!
//! Every tool returns human-readable text; error text is the only UI this
//! service has, so user-level failures come back as advisory text with a
//! headline and a suggested action rather than protocol errors.

use crate::env::Environment;
use chrono::Utc;
use refork_registry::ForkEvent;
use refork_search::{SearchError, SearchRequest, SearchResult, TemporalQuery};
use refork_vector_store::VectorStoreError;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: fn() -> Value,
}

pub const TOOL_CATALOG: &[ToolDescriptor] = &[
    ToolDescriptor {
        name: "fork-detect",
        description: "Search past sessions relevant to a query and rank fork candidates.",
        input_schema: fork_detect_schema,
    },
    ToolDescriptor {
        name: "get-session-preview",
        description: "Show metadata and a content preview for one session.",
        input_schema: session_id_schema,
    },
    ToolDescriptor {
        name: "get-fork-history",
        description: "List recent fork selections, newest first.",
        input_schema: limit_schema,
    },
    ToolDescriptor {
        name: "record-fork",
        description: "Record that a session was forked from a ranked result list.",
        input_schema: record_fork_schema,
    },
    ToolDescriptor {
        name: "add-session-tag",
        description: "Add a tag to a session.",
        input_schema: session_tag_schema,
    },
    ToolDescriptor {
        name: "remove-session-tag",
        description: "Remove a tag from a session.",
        input_schema: session_tag_schema,
    },
    ToolDescriptor {
        name: "list-session-tags",
        description: "List a session's tags.",
        input_schema: session_id_schema,
    },
    ToolDescriptor {
        name: "get-session-summary",
        description: "Extractive summary of a session (cached, regenerates on growth).",
        input_schema: session_id_schema,
    },
    ToolDescriptor {
        name: "cluster-sessions",
        description: "Cluster all sessions by topic (k-means over session embeddings).",
        input_schema: cluster_schema,
    },
    ToolDescriptor {
        name: "get-session-clusters",
        description: "Show the last computed cluster assignment.",
        input_schema: empty_schema,
    },
    ToolDescriptor {
        name: "get-cluster-sessions",
        description: "List the sessions in one cluster.",
        input_schema: cluster_id_schema,
    },
    ToolDescriptor {
        name: "compare-sessions",
        description: "Semantic diff of two sessions: common ground and unique parts.",
        input_schema: compare_schema,
    },
    ToolDescriptor {
        name: "get-similar-sessions",
        description: "Sessions most similar to a reference session.",
        input_schema: similar_schema,
    },
];

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn fork_detect_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": "What you want to work on" },
            "project": { "type": "string", "description": "Project label, or \"current\"" },
            "scope": { "type": "string", "enum": ["all", "project"] },
            "tags": { "type": "array", "items": { "type": "string" } },
            "time_range": {
                "description": "e.g. \"last_week\", \"3 days ago\", or {from, to}",
                "anyOf": [
                    { "type": "string" },
                    {
                        "type": "object",
                        "properties": {
                            "from": { "type": "string" },
                            "to": { "type": "string" }
                        }
                    }
                ]
            },
            "include_archive": { "type": "boolean" },
            "limit": { "type": "integer", "minimum": 1, "maximum": 50 }
        },
        "required": ["query"]
    })
}

fn session_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": { "type": "string" }
        },
        "required": ["session_id"]
    })
}

fn limit_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "limit": { "type": "integer", "minimum": 1, "maximum": 100 }
        }
    })
}

fn record_fork_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": { "type": "string" },
            "query": { "type": "string", "description": "The query the ranking came from" },
            "position": { "type": "integer", "minimum": 0 },
            "outcome": { "type": "string" }
        },
        "required": ["session_id", "query", "position"]
    })
}

fn session_tag_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": { "type": "string" },
            "tag": { "type": "string" }
        },
        "required": ["session_id", "tag"]
    })
}

fn cluster_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "k": { "type": "integer", "minimum": 1, "maximum": 100 }
        }
    })
}

fn cluster_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "cluster_id": { "type": "integer", "minimum": 0 }
        },
        "required": ["cluster_id"]
    })
}

fn compare_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id_1": { "type": "string" },
            "session_id_2": { "type": "string" }
        },
        "required": ["session_id_1", "session_id_2"]
    })
}

fn similar_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": { "type": "string" },
            "limit": { "type": "integer", "minimum": 1, "maximum": 50 }
        },
        "required": ["session_id"]
    })
}

#[must_use]
pub fn tools_list_result() -> Value {
    let tools: Vec<Value> = TOOL_CATALOG
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": (tool.input_schema)(),
            })
        })
        .collect();
    json!({ "tools": tools })
}

#[must_use]
pub fn is_known_tool(name: &str) -> bool {
    TOOL_CATALOG.iter().any(|tool| tool.name == name)
}

/// Tool failures that should surface as JSON-RPC errors rather than text.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    DependencyUnavailable(String),
}

/// Run one tool. User-level failures (missing session, no results, model
/// unavailable) come back as `Ok` advisory text.
pub async fn call_tool(
    env: &Arc<Environment>,
    name: &str,
    args: &Value,
) -> Result<String, ToolError> {
    match name {
        "fork-detect" => fork_detect(env, args).await,
        "get-session-preview" => session_preview(env, args).await,
        "get-fork-history" => fork_history(env, args),
        "record-fork" => record_fork(env, args),
        "add-session-tag" => add_tag(env, args),
        "remove-session-tag" => remove_tag(env, args),
        "list-session-tags" => list_tags(env, args),
        "get-session-summary" => session_summary(env, args),
        "cluster-sessions" => cluster_sessions(env, args),
        "get-session-clusters" => session_clusters(env),
        "get-cluster-sessions" => cluster_members(env, args),
        "compare-sessions" => compare_sessions(env, args),
        "get-similar-sessions" => similar_sessions(env, args),
        other => Err(ToolError::InvalidParams(format!("unknown tool {other}"))),
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidParams(format!("missing required argument '{key}'")))
}

fn search_error_text(err: &SearchError, query: &str) -> Option<String> {
    match err {
        SearchError::VectorStore(VectorStoreError::EmbeddingUnavailable(reason)) => Some(format!(
            "Embedding model unavailable\n\nQuery: {query}\nKind: EmbeddingUnavailable\n\
             Detail: {reason}\n\nSuggestion: run `refork-setup` once to download and warm the \
             embedding model, then retry."
        )),
        SearchError::NotFound(id) => Some(format!(
            "Session not found\n\nKind: NotFound\nSession: {id}\n\nSuggestion: run fork-detect \
             first and use a session id from its results."
        )),
        SearchError::InvalidArgument(reason) => Some(format!(
            "Invalid request\n\nKind: InvalidArgument\nDetail: {reason}"
        )),
        _ => None,
    }
}

fn render_search_error(err: SearchError, query: &str) -> Result<String, ToolError> {
    match search_error_text(&err, query) {
        Some(text) => Ok(text),
        None => Err(ToolError::DependencyUnavailable(err.to_string())),
    }
}

async fn fork_detect(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let query = required_str(args, "query")?.to_string();

    let scope = args.get("scope").and_then(Value::as_str).unwrap_or("all");
    let project = match args.get("project").and_then(Value::as_str) {
        Some("current") => current_project(),
        Some(project) => Some(project.to_string()),
        None if scope == "project" => current_project(),
        None => None,
    };
    let tags: Vec<String> = args
        .get("tags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let time_range = parse_time_range(args.get("time_range"))?;
    let include_archive = args
        .get("include_archive")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l.clamp(1, 50) as usize);

    let request = SearchRequest {
        query: query.clone(),
        project,
        tags,
        time_range,
        include_archive,
        limit,
    };
    let results = match env.search.search(&request).await {
        Ok(results) => results,
        Err(err) => return render_search_error(err, &query),
    };

    if results.is_empty() {
        return Ok(format!(
            "No matching sessions\n\nQuery: {query}\n\nSuggestion: broaden the query, drop \
             filters, or pass include_archive=true."
        ));
    }

    let mut out = format!("Fork candidates for \"{query}\":\n");
    for (position, result) in results.iter().enumerate() {
        out.push_str(&render_candidate(env, position, result));
    }
    out.push_str(
        "\nUse record-fork with the session id and its position after you pick one.\n",
    );
    Ok(out)
}

fn render_candidate(env: &Arc<Environment>, position: usize, result: &SearchResult) -> String {
    let meta = &result.metadata;
    let (terminal, in_session) =
        env.fork_commands(&result.session_id, meta.project.as_deref());
    let updated = meta
        .updated_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let tags = if meta.tags.is_empty() {
        String::new()
    } else {
        format!("   tags: {}\n", meta.tags.join(", "))
    };
    format!(
        "\n{rank}. {id}  (score {total:.3})\n   project: {project}  |  updated: {updated}  |  \
         {messages} messages, {chunks} chunks\n   score: best {best:.2}, avg {avg:.2}, \
         recency {recency:.2}, memory +{memory:.2}, preference +{pref:.2}\n{tags}   \
         preview: {preview}\n   fork (terminal):   {terminal}\n   fork (in-session): \
         {in_session}\n",
        rank = position + 1,
        id = result.session_id,
        total = result.score.total,
        project = meta.project.as_deref().unwrap_or("unknown"),
        messages = meta.message_count,
        chunks = meta.chunk_count,
        best = result.score.best_similarity,
        avg = result.score.avg_similarity,
        recency = result.score.recency,
        memory = result.score.memory_boost,
        pref = result.score.preference_boost,
        preview = result.preview.replace('\n', " "),
    )
}

fn parse_time_range(value: Option<&Value>) -> Result<Option<TemporalQuery>, ToolError> {
    let now = Utc::now();
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => TemporalQuery::parse(raw, now).map(Some).ok_or_else(|| {
            ToolError::InvalidParams(format!("unrecognized time_range '{raw}'"))
        }),
        Some(Value::Object(map)) => {
            let from = map.get("from").and_then(Value::as_str);
            let to = map.get("to").and_then(Value::as_str);
            TemporalQuery::parse_bounds(from, to, now)
                .map(Some)
                .ok_or_else(|| {
                    ToolError::InvalidParams("unrecognized time_range bounds".to_string())
                })
        }
        Some(_) => Err(ToolError::InvalidParams(
            "time_range must be a string or {from, to}".to_string(),
        )),
    }
}

fn current_project() -> Option<String> {
    std::env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
}

async fn session_preview(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let Some(meta) = env
        .registry
        .get(session_id)
        .map_err(|e| ToolError::DependencyUnavailable(e.to_string()))?
    else {
        return Ok(format!(
            "Session not found\n\nKind: NotFound\nSession: {session_id}\n\nSuggestion: run \
             fork-detect first and use a session id from its results."
        ));
    };

    let chunks = env
        .store
        .chunks_by_session(session_id)
        .map_err(|e| ToolError::DependencyUnavailable(e.to_string()))?;
    let preview: String = chunks
        .iter()
        .take(2)
        .map(|(record, _)| record.text.trim())
        .collect::<Vec<_>>()
        .join("\n---\n")
        .chars()
        .take(600)
        .collect();

    let (terminal, in_session) = env.fork_commands(session_id, meta.project.as_deref());
    Ok(format!(
        "Session {session_id}\n  project: {}\n  created: {}\n  updated: {}\n  messages: {}\n  \
         chunks: {}\n  tags: {}\n  archived: {}\n\nPreview:\n{preview}\n\nFork (terminal):   \
         {terminal}\nFork (in-session): {in_session}\n",
        meta.project.as_deref().unwrap_or("unknown"),
        meta.created_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown".into()),
        meta.updated_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown".into()),
        meta.message_count,
        meta.chunk_count,
        if meta.tags.is_empty() { "none".to_string() } else { meta.tags.join(", ") },
        meta.archived,
    ))
}

fn fork_history(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l.clamp(1, 100) as usize)
        .unwrap_or(10);
    let events = env
        .fork_history
        .list(limit)
        .map_err(|e| ToolError::DependencyUnavailable(e.to_string()))?;
    if events.is_empty() {
        return Ok("No forks recorded yet.".to_string());
    }
    let mut out = format!("Last {} forks:\n", events.len());
    for event in events {
        out.push_str(&format!(
            "- {}  {}  (position {}, query \"{}\"{})\n",
            event.timestamp.format("%Y-%m-%d %H:%M"),
            event.session_id,
            event.position + 1,
            event.query,
            event
                .outcome
                .as_deref()
                .map(|o| format!(", outcome {o}"))
                .unwrap_or_default(),
        ));
    }
    Ok(out)
}

fn record_fork(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let query = required_str(args, "query")?;
    let position = args
        .get("position")
        .and_then(Value::as_u64)
        .ok_or_else(|| ToolError::InvalidParams("missing required argument 'position'".into()))?
        as usize;
    let outcome = args
        .get("outcome")
        .and_then(Value::as_str)
        .map(str::to_string);

    env.fork_history
        .record(ForkEvent {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            query: query.to_string(),
            position,
            outcome,
        })
        .map_err(|e| ToolError::DependencyUnavailable(e.to_string()))?;
    Ok(format!(
        "Recorded fork of {session_id} at position {} for \"{query}\". Future rankings will \
         prefer it.",
        position + 1
    ))
}

fn add_tag(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let tag = required_str(args, "tag")?;
    match env.tags.add_tag(session_id, tag) {
        Ok(tags) => Ok(format!(
            "Tagged {session_id}. Tags now: {}",
            tags.join(", ")
        )),
        Err(err) => render_search_error(err, tag),
    }
}

fn remove_tag(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let tag = required_str(args, "tag")?;
    match env.tags.remove_tag(session_id, tag) {
        Ok(tags) => Ok(if tags.is_empty() {
            format!("Removed '{tag}' from {session_id}. No tags remain.")
        } else {
            format!(
                "Removed '{tag}' from {session_id}. Remaining: {}",
                tags.join(", ")
            )
        }),
        Err(err) => render_search_error(err, tag),
    }
}

fn list_tags(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let session_id = required_str(args, "session_id")?;
    match env.tags.list_tags(session_id) {
        Ok(tags) if tags.is_empty() => Ok(format!("{session_id} has no tags.")),
        Ok(tags) => Ok(format!("Tags for {session_id}: {}", tags.join(", "))),
        Err(err) => render_search_error(err, session_id),
    }
}

fn session_summary(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let session_id = required_str(args, "session_id")?;
    match env.summary.get_or_generate(session_id) {
        Ok(summary) if summary.is_empty() => Ok(format!(
            "Session {session_id} has no summarizable prose (code-only transcript)."
        )),
        Ok(summary) => Ok(format!("Summary of {session_id}:\n{summary}")),
        Err(err) => render_search_error(err, session_id),
    }
}

fn cluster_sessions(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let k = args
        .get("k")
        .and_then(Value::as_u64)
        .map(|k| k.clamp(1, 100) as usize);
    match env.clusters.cluster_sessions(k) {
        Ok(snapshot) => Ok(render_clusters(&snapshot)),
        Err(err) => render_search_error(err, "cluster-sessions"),
    }
}

fn session_clusters(env: &Arc<Environment>) -> Result<String, ToolError> {
    match env
        .clusters
        .load_snapshot()
        .map_err(|e| ToolError::DependencyUnavailable(e.to_string()))?
    {
        Some(snapshot) => Ok(render_clusters(&snapshot)),
        None => Ok(
            "No cluster snapshot yet.\n\nSuggestion: run cluster-sessions first.".to_string(),
        ),
    }
}

fn render_clusters(snapshot: &refork_search::ClusterSnapshot) -> String {
    let mut out = format!(
        "{} clusters (silhouette {:.2}, computed {}):\n",
        snapshot.clusters.len(),
        snapshot.silhouette,
        snapshot.generated_at.format("%Y-%m-%d %H:%M"),
    );
    for cluster in &snapshot.clusters {
        out.push_str(&format!(
            "\n[{}] {} — {} sessions\n",
            cluster.cluster_id,
            cluster.label,
            cluster.session_ids.len()
        ));
        for id in cluster.session_ids.iter().take(5) {
            out.push_str(&format!("    {id}\n"));
        }
        if cluster.session_ids.len() > 5 {
            out.push_str(&format!("    ... {} more\n", cluster.session_ids.len() - 5));
        }
    }
    out
}

fn cluster_members(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let cluster_id = args
        .get("cluster_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ToolError::InvalidParams("missing required argument 'cluster_id'".into())
        })? as usize;
    let Some(snapshot) = env
        .clusters
        .load_snapshot()
        .map_err(|e| ToolError::DependencyUnavailable(e.to_string()))?
    else {
        return Ok(
            "No cluster snapshot yet.\n\nSuggestion: run cluster-sessions first.".to_string(),
        );
    };
    match snapshot
        .clusters
        .iter()
        .find(|c| c.cluster_id == cluster_id)
    {
        Some(cluster) => {
            let mut out = format!(
                "Cluster [{}] {} — {} sessions:\n",
                cluster.cluster_id,
                cluster.label,
                cluster.session_ids.len()
            );
            for id in &cluster.session_ids {
                out.push_str(&format!("  {id}\n"));
            }
            Ok(out)
        }
        None => Ok(format!(
            "Cluster {cluster_id} does not exist in the current snapshot."
        )),
    }
}

fn compare_sessions(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let a = required_str(args, "session_id_1")?;
    let b = required_str(args, "session_id_2")?;
    let diff = match env.diff.compare(a, b) {
        Ok(diff) => diff,
        Err(err) => return render_search_error(err, a),
    };

    let mut out = format!(
        "Comparing {a} vs {b}\n  overall similarity: {:.2} (content {:.2}, topics {:.2})\n  \
         matched chunk pairs: {}\n  unique to {a}: {} chunks\n  unique to {b}: {} chunks\n",
        diff.overall,
        diff.content_score,
        diff.topic_overlap,
        diff.common.len(),
        diff.unique_to_a.len(),
        diff.unique_to_b.len(),
    );
    if !diff.common_topics.is_empty() {
        out.push_str(&format!(
            "  shared topics: {}\n",
            diff.common_topics.join(", ")
        ));
    }
    for matched in diff.common.iter().take(3) {
        out.push_str(&format!(
            "\n  ~{:.2}  \"{}\"\n        \"{}\"\n",
            matched.similarity, matched.excerpt_a, matched.excerpt_b
        ));
    }
    Ok(out)
}

fn similar_sessions(env: &Arc<Environment>, args: &Value) -> Result<String, ToolError> {
    let session_id = required_str(args, "session_id")?;
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l.clamp(1, 50) as usize)
        .unwrap_or(5);
    let pairs = match env.duplicates.similar_to(session_id, limit) {
        Ok(pairs) => pairs,
        Err(err) => return render_search_error(err, session_id),
    };
    if pairs.is_empty() {
        return Ok(format!("No sessions similar to {session_id} found."));
    }
    let mut out = format!("Sessions similar to {session_id}:\n");
    for pair in pairs {
        out.push_str(&format!(
            "  {:.2}  {}\n",
            pair.similarity, pair.session_b
        ));
    }
    Ok(out)
}
