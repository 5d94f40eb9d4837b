//! Protocol-level tests driving the dispatcher over in-memory pipes.

use refork_config::Config;
use refork_mcp_server::{Dispatcher, DispatcherConfig, Environment};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct Session {
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    reader: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    _server: tokio::task::JoinHandle<()>,
    _tmp: TempDir,
}

async fn start_session() -> Session {
    std::env::set_var("REFORK_EMBEDDING_MODE", "stub");
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage_dir = Some(tmp.path().join("storage"));
    config.producer_dir = Some(tmp.path().join("producer"));
    config.embedding.dimension = 16;
    std::fs::create_dir_all(tmp.path().join("producer")).unwrap();

    let env = Arc::new(Environment::init(config).unwrap());
    seed_session(&env, "oauth-session", "implementing oauth jwt refresh flow").await;
    seed_session(&env, "css-session", "fighting css grid layouts").await;

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let dispatcher = Dispatcher::new(
        Some(env),
        DispatcherConfig {
            tool_timeout: Duration::from_secs(10),
            tool_concurrency: 2,
        },
    );
    let server_task = tokio::spawn(async move {
        let _ = dispatcher.run(server_read, server_write).await;
    });

    Session {
        writer: client_write,
        reader: BufReader::new(client_read),
        _server: server_task,
        _tmp: tmp,
    }
}

async fn seed_session(env: &Arc<Environment>, session_id: &str, content: &str) {
    let path = env.producer_dir.join(format!("{session_id}.jsonl"));
    let lines = format!(
        "{}\n{}\n",
        json!({"role": "user", "content": content, "timestamp": "2026-07-20T10:00:00Z"}),
        json!({"role": "assistant", "content": format!("notes about {content}"),
               "timestamp": "2026-07-20T10:05:00Z"}),
    );
    std::fs::write(&path, lines).unwrap();
    env.indexer.index_file(&path).await.unwrap();
}

impl Session {
    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, value: Value) {
        self.send_line(&value.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let read = tokio::time::timeout(
            Duration::from_secs(10),
            self.reader.read_line(&mut line),
        )
        .await
        .expect("response within timeout")
        .unwrap();
        assert!(read > 0, "stream closed unexpectedly");
        serde_json::from_str(&line).expect("response is valid JSON")
    }

    async fn handshake(&mut self) {
        self.send(json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"}
            }
        }))
        .await;
        let response = self.recv().await;
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
    }

    async fn call_tool(&mut self, id: u64, name: &str, args: Value) -> Value {
        self.send(json!({
            "jsonrpc": "2.0", "id": id, "method": "tools/call",
            "params": {"name": name, "arguments": args}
        }))
        .await;
        self.recv().await
    }
}

#[tokio::test]
async fn initialize_handshake_and_tools_list() {
    let mut session = start_session().await;
    session.handshake().await;

    session
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .await;
    let response = session.recv().await;
    assert_eq!(response["id"], 1);
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 13);
    assert!(tools.iter().any(|t| t["name"] == "fork-detect"));
    for tool in tools {
        assert!(tool["inputSchema"]["type"] == "object");
        assert!(tool["description"].as_str().is_some());
    }
}

#[tokio::test]
async fn tool_call_before_handshake_is_rejected() {
    let mut session = start_session().await;
    session
        .send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "fork-detect", "arguments": {"query": "anything"}}
        }))
        .await;
    let response = session.recv().await;
    assert_eq!(response["error"]["code"], -32002);
}

#[tokio::test]
async fn unknown_method_and_parse_error_codes() {
    let mut session = start_session().await;
    session.handshake().await;

    session
        .send(json!({"jsonrpc": "2.0", "id": 5, "method": "no/such/method"}))
        .await;
    let response = session.recv().await;
    assert_eq!(response["id"], 5);
    assert_eq!(response["error"]["code"], -32601);

    session.send_line("this is not json").await;
    let response = session.recv().await;
    assert_eq!(response["error"]["code"], -32700);
    assert_eq!(response["id"], Value::Null);
}

#[tokio::test]
async fn notifications_produce_no_response() {
    let mut session = start_session().await;
    session.handshake().await;

    // A notification, then a request: the first response must belong to the
    // request.
    session
        .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;
    session
        .send(json!({"jsonrpc": "2.0", "id": 42, "method": "tools/list"}))
        .await;
    let response = session.recv().await;
    assert_eq!(response["id"], 42);
}

#[tokio::test]
async fn unknown_tool_is_32001() {
    let mut session = start_session().await;
    session.handshake().await;
    let response = session.call_tool(7, "no-such-tool", json!({})).await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["error"]["code"], -32001);
}

#[tokio::test]
async fn fork_detect_returns_ranked_text() {
    let mut session = start_session().await;
    session.handshake().await;

    let response = session
        .call_tool(
            10,
            "fork-detect",
            json!({"query": "implementing oauth jwt refresh flow"}),
        )
        .await;
    assert_eq!(response["id"], 10);
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("oauth-session"), "got: {text}");
    assert!(text.contains("claude --resume oauth-session --fork-session"));
    assert!(text.contains("score"));
}

#[tokio::test]
async fn fork_detect_missing_query_is_invalid_params() {
    let mut session = start_session().await;
    session.handshake().await;
    let response = session.call_tool(11, "fork-detect", json!({})).await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn record_fork_then_history_round_trip() {
    let mut session = start_session().await;
    session.handshake().await;

    let response = session
        .call_tool(
            20,
            "record-fork",
            json!({"session_id": "oauth-session", "query": "OAuth JWT", "position": 0}),
        )
        .await;
    assert!(response["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("Recorded fork"));

    let response = session.call_tool(21, "get-fork-history", json!({})).await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("oauth-session"));
    assert!(text.contains("oauth jwt"), "query should be normalized: {text}");
}

#[tokio::test]
async fn tag_workflow_over_the_wire() {
    let mut session = start_session().await;
    session.handshake().await;

    let response = session
        .call_tool(
            30,
            "add-session-tag",
            json!({"session_id": "oauth-session", "tag": "Auth"}),
        )
        .await;
    assert!(response["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("auth"));

    let response = session
        .call_tool(31, "list-session-tags", json!({"session_id": "oauth-session"}))
        .await;
    assert!(response["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("auth"));

    let response = session
        .call_tool(
            32,
            "remove-session-tag",
            json!({"session_id": "oauth-session", "tag": "auth"}),
        )
        .await;
    assert!(response["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("No tags remain"));
}

#[tokio::test]
async fn missing_session_is_advisory_text_not_protocol_error() {
    let mut session = start_session().await;
    session.handshake().await;

    let response = session
        .call_tool(40, "get-session-preview", json!({"session_id": "ghost"}))
        .await;
    assert!(response["error"].is_null());
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("Session not found"));
    assert!(text.contains("Suggestion"));
}

#[tokio::test]
async fn concurrent_requests_correlate_by_id() {
    let mut session = start_session().await;
    session.handshake().await;

    for id in [100u64, 101, 102] {
        session
            .send(json!({
                "jsonrpc": "2.0", "id": id, "method": "tools/call",
                "params": {"name": "get-fork-history", "arguments": {}}
            }))
            .await;
    }
    let mut seen = std::collections::HashSet::new();
    for _ in 0..3 {
        let response = session.recv().await;
        let id = response["id"].as_u64().unwrap();
        assert!(seen.insert(id), "duplicate response for id {id}");
        assert!((100..=102).contains(&id));
    }
}

#[tokio::test]
async fn degraded_mode_reports_service_uninitialized() {
    let (client, server) = tokio::io::duplex(16 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let dispatcher = Dispatcher::new(None, DispatcherConfig::default());
    let _task = tokio::spawn(async move {
        let _ = dispatcher.run(server_read, server_write).await;
    });

    let mut session = Session {
        writer: client_write,
        reader: BufReader::new(client_read),
        _server: tokio::spawn(async {}),
        _tmp: TempDir::new().unwrap(),
    };
    session.handshake().await;
    let response = session
        .call_tool(1, "fork-detect", json!({"query": "anything"}))
        .await;
    assert_eq!(response["error"]["code"], -32002);
}
