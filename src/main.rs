mod cli;

use std::{
    io::{self, Read},
    process::ExitCode,
};

use anyhow::{bail, Context, Result};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use pybridge::{
    config::{RUNTIME_KEY, TIMEOUT_KEY},
    BridgeError, CancellationToken, Config, ExecutionBridge, Script,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args = cli::Cli::parse();

    // CLI flags override rc file and environment
    let mut cfg = Config::load();
    if let Some(runtime) = &args.runtime {
        cfg.set(RUNTIME_KEY, runtime.as_str());
    }
    if let Some(ms) = args.timeout_ms {
        cfg.set(TIMEOUT_KEY, ms.to_string());
    }

    if args.runtime_version {
        println!("{}", pybridge::version(&cfg.runtime()).await?);
        return Ok(ExitCode::SUCCESS);
    }

    let script = match (args.script, args.code) {
        (Some(path), None) => Script::File(path.into()),
        (None, Some(code)) => Script::Inline(code),
        _ => bail!("Provide a SCRIPT path or --code"),
    };

    let input = match args.input.as_deref() {
        Some(text) => Some(parse_input(text).context("--input is not valid JSON")?),
        None if !io::stdin().is_terminal() => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            if buf.trim().is_empty() {
                None
            } else {
                Some(parse_input(&buf).context("stdin is not valid JSON")?)
            }
        }
        None => None,
    };

    let mut bridge = ExecutionBridge::from_config(&cfg, script)?;
    let mut diagnostics = bridge.subscribe();
    let quiet = args.quiet;
    let colored = io::stderr().is_terminal();
    let printer = tokio::spawn(async move {
        while let Some(line) = diagnostics.recv().await {
            if quiet {
                continue;
            }
            if colored {
                eprintln!("{}", line.dimmed());
            } else {
                eprintln!("{}", line);
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = bridge
        .call::<Value, Value>(input.as_ref(), !args.no_output, Some(&cancel))
        .await;
    // Closing the observer channel lets the printer finish its backlog.
    drop(bridge);
    let _ = printer.await;

    match outcome {
        Ok(result) => {
            if let Some(value) = result.output {
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            tracing::info!(elapsed = ?result.elapsed, "script finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(BridgeError::ExecutionFailure { exit_code, stderr }) => {
            eprint!("{}", stderr);
            let code = exit_code
                .and_then(|c| u8::try_from(c).ok())
                .filter(|c| *c != 0)
                .unwrap_or(1);
            Ok(ExitCode::from(code))
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_input(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}
