//! Refork MCP server.
//!
//! Semantic search and session forking over historical coding-assistant
//! transcripts, exposed as MCP tools on stdio.
//!
//! ## Tools
//!
//! - `fork-detect` — ranked fork candidates for a natural-language query
//! - `get-session-preview` — metadata + content preview for one session
//! - `get-fork-history` / `record-fork` — the selection log feeding ranking
//! - `add-session-tag` / `remove-session-tag` / `list-session-tags`
//! - `get-session-summary` — cached extractive summary
//! - `cluster-sessions` / `get-session-clusters` / `get-cluster-sessions`
//! - `compare-sessions` — semantic diff of two sessions
//! - `get-similar-sessions` — nearest sessions to a reference
//!
//! ## Usage
//!
//! ```json
//! { "mcpServers": { "refork": { "command": "refork-mcp" } } }
//! ```

use anyhow::Result;
use refork_config::Config;
use refork_mcp_server::{Dispatcher, DispatcherConfig, Environment};
use std::sync::Arc;

fn print_help() {
    println!("Refork MCP server");
    println!();
    println!("Usage: refork-mcp [--print-tools|--version|--help]");
    println!();
    println!("Flags:");
    println!("  --print-tools  Print the tool inventory as JSON and exit");
    println!("  --version      Print version and exit");
    println!("  --help         Print this help and exit");
    println!();
    println!("Env:");
    println!("  REFORK_MCP_LOG=1        Enable stderr logging (stdout carries the protocol)");
    println!("  STORAGE_DIR=PATH        Override the storage directory");
    println!("  PRODUCER_DIR=PATH       Override the transcript directory");
}

fn logging_enabled() -> bool {
    // Any stray bytes on stdout break clients, and some clients merge
    // stderr into stdout; logging stays opt-in.
    std::env::var("REFORK_MCP_LOG")
        .ok()
        .map(|v| {
            let v = v.trim();
            !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
        })
        .unwrap_or(false)
}

fn handle_cli_args() -> Option<i32> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("--stdio") | Some("stdio") => None,
        Some("--print-tools") => {
            let tools = refork_mcp_server::tools::tools_list_result();
            println!("{}", serde_json::to_string_pretty(&tools).unwrap_or_default());
            Some(0)
        }
        Some("--version") | Some("-V") => {
            println!("refork-mcp {}", env!("CARGO_PKG_VERSION"));
            Some(0)
        }
        Some("--help") | Some("-h") => {
            print_help();
            Some(0)
        }
        Some(other) => {
            // Agent launchers pass transport selectors and wrapper flags;
            // starting anyway beats failing the whole toolchain.
            if logging_enabled() {
                log::warn!("Ignoring unknown arguments starting at {other}");
            }
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if logging_enabled() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .target(env_logger::Target::Stderr)
            .init();
    }
    if let Some(code) = handle_cli_args() {
        std::process::exit(code);
    }

    let storage_dir = Config::default().storage_dir();
    let config = Config::load(&Config::config_path(&storage_dir))?;
    config.validate()?;

    // A broken store must not kill the protocol: the dispatcher answers
    // ServiceUninitialized until the problem is fixed.
    let env = match Environment::init(config) {
        Ok(env) => Some(Arc::new(env)),
        Err(err) => {
            log::error!("Service degraded, storage unavailable: {err:#}");
            None
        }
    };
    let background = env.as_ref().and_then(Environment::start_background_indexer);

    log::info!("Refork MCP server ready");
    let dispatcher = Dispatcher::new(env, DispatcherConfig::default());
    dispatcher
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await?;

    if let Some(background) = background {
        background.shutdown().await;
    }
    log::info!("Refork MCP server stopped");
    Ok(())
}
