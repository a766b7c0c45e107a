//! Hive 命令行入口
//!
//! 用法：`hive [--config PATH] [TASK...]`。任务按顺序在同一个 Orchestrator 上运行，后面的任务能看到前面留下的变量；
//! 不给任务时从 stdin 逐行读取。答案输出到 stdout，日志输出到 stderr。

use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::config::{load_config, AppConfig};
use hive::core::{handler_from_config, Orchestrator, OrchestratorHandle, ValidationMode};
use hive::llm::create_llm_from_config;
use hive::tools::EchoTool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "Usage: hive [--config PATH] [TASK...]\n\
Runs each TASK in order on one orchestrator. Without TASK arguments, reads one task per line from stdin.";

struct CliArgs {
    config: Option<PathBuf>,
    tasks: Vec<String>,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut cli = CliArgs {
        config: None,
        tasks: Vec::new(),
        help: false,
    };
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                cli.config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => cli.help = true,
            _ => cli.tasks.push(arg),
        }
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = parse_args(std::env::args().skip(1))?;
    if cli.help {
        println!("{}", USAGE);
        return Ok(());
    }

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    if cfg.validation.mode == ValidationMode::Interactive && cli.tasks.is_empty() {
        bail!("interactive validation reads decisions from stdin; pass tasks as arguments");
    }

    let llm = create_llm_from_config(&cfg.llm);
    let handler = handler_from_config(&cfg.validation, llm.clone(), &cfg.llm.model);
    let agent = cfg.agent_config().tool(EchoTool);
    let orchestrator = Orchestrator::new(agent, llm.clone())
        .with_handler(handler)
        .with_settings(cfg.orchestrator_settings())
        .start()
        .context("Failed to start orchestrator")?;

    let mut progress = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!(event = %json, "progress");
            }
        }
    });

    let mut failures = 0usize;
    if cli.tasks.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            let task = line.trim();
            if !task.is_empty() && !run_one(&orchestrator, task).await {
                failures += 1;
            }
        }
    } else {
        for task in &cli.tasks {
            if !run_one(&orchestrator, task).await {
                failures += 1;
            }
        }
    }

    orchestrator.stop().await.ok();
    let (prompt_tokens, completion_tokens, total_tokens) = llm.token_usage();
    tracing::info!(prompt_tokens, completion_tokens, total_tokens, "Token usage");
    if failures > 0 {
        bail!("{} task(s) did not complete", failures);
    }
    Ok(())
}

async fn run_one(orchestrator: &OrchestratorHandle, task: &str) -> bool {
    match orchestrator.run_task(task).await {
        Ok(answer) => {
            println!("{}", answer);
            true
        }
        Err(e) => {
            eprintln!("error: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let cli = parse_args(
            ["--config", "my.toml", "Calculate 1+1", "then double it"]
                .into_iter()
                .map(String::from),
        )
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("my.toml")));
        assert_eq!(cli.tasks, vec!["Calculate 1+1", "then double it"]);
        assert!(!cli.help);
        assert!(parse_args(["--config".to_string()]).is_err());
    }
}
