//! toolhive 命令行入口
//!
//! 每行输入是对话 `cli` 上的一轮；`:health` 打印健康快照，`:history` 打印历史，
//! `:clear` 清空对话，`:quit` 退出。Ctrl+C / SIGTERM 触发优雅关闭。

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use toolhive::config::{load_config, AppConfig};
use toolhive::core::{run_until_shutdown, Orchestrator, ShutdownManager, TurnRequest};
use toolhive::RuntimeBuilder;

const CONVERSATION_ID: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolhive::observability::init_stderr();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let runtime = RuntimeBuilder::new(cfg).build();
    runtime.start_background();

    let manager = Arc::new(ShutdownManager::new());
    let coordinator = runtime.shutdown_coordinator(Arc::clone(&manager));
    let orchestrator = Arc::clone(&runtime.orchestrator);

    println!("toolhive ready. Commands: :health :history :clear :quit");
    let reason = run_until_shutdown(&coordinator, async move {
        if let Err(e) = repl(&orchestrator).await {
            tracing::error!("repl failed: {:#}", e);
        }
    })
    .await;
    tracing::info!(reason = ?reason, "toolhive stopped");
    Ok(())
}

async fn repl(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await.context("read stdin")? else {
            return Ok(());
        };
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":q" => return Ok(()),
            ":health" => {
                let snapshot = orchestrator.health();
                println!("{}", serde_json::to_string_pretty(&*snapshot)?);
            }
            ":history" => match orchestrator.history(CONVERSATION_ID).await {
                Some(messages) => {
                    for msg in messages {
                        println!("[{}] {}", msg.role(), msg.text());
                    }
                }
                None => println!("(empty)"),
            },
            ":clear" => {
                orchestrator.clear(CONVERSATION_ID).await;
                println!("(cleared)");
            }
            input => {
                let request = TurnRequest::new(CONVERSATION_ID, input).with_source("cli");
                match orchestrator.handle_turn(request).await {
                    Ok(response) => {
                        for action in &response.actions {
                            println!("  · {} {}", action.tool, action.input);
                        }
                        println!("{}", response.answer);
                    }
                    Err(e) => {
                        println!("error: {}", e);
                        return Ok(());
                    }
                }
            }
        }
    }
}
