use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use stc::config;
use stc::coordinator::{self, Coordinator};
use stc::listener::{Listener, TracingListener};
use stc::model::Status;
use stc::{compiler, processor, scenario};

/// CLI entrypoint using `clap` to define subcommands
#[derive(Parser)]
#[command(name = "stc", version, about = "System test coordinator: compiles an XML scenario into a DAG and runs it")]
struct Cli {
    /// Path to the scenario XML document
    scenario_file: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand)]
enum Command {
    /// Compile and execute the scenario (the default when no subcommand is given)
    Run {
        /// `from <patterns...> [to <patterns...>]`, restricting the run to a subgraph
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        range: Vec<String>,
    },
    /// List every step and its last known status, without running anything
    List,
    /// List only the steps whose last recorded status is FAILED
    #[command(name = "listFailed")]
    ListFailed,
    /// Compile the scenario and report errors, without running anything
    Validate,
}

/// Splits a `run` subcommand's trailing args into `from`/`to` glob patterns.
/// Accepts `from P1 P2 to P3 P4`, `from P1 P2`, `to P1 P2`, or no keywords at
/// all (treated as an unrestricted run).
fn parse_range(args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut from = Vec::new();
    let mut to = Vec::new();
    let mut target: Option<&mut Vec<String>> = None;

    for arg in args {
        match arg.as_str() {
            "from" => target = Some(&mut from),
            "to" => target = Some(&mut to),
            _ => {
                if let Some(bucket) = target.as_deref_mut() {
                    bucket.push(arg.clone());
                }
            }
        }
    }
    (from, to)
}

/// Prints progress to the terminal, honoring `stcColor`/`stcDumpLogs`.
struct ConsoleListener {
    color: bool,
    dump_logs: bool,
}

impl Listener for ConsoleListener {
    fn on_start(&self, step: &str, command: &str) {
        if self.color {
            println!("\x1b[34m▶\x1b[0m {step} :: {command}");
        } else {
            println!("> {step} :: {command}");
        }
    }

    fn on_output(&self, step: &str, line: &str) {
        if self.dump_logs {
            println!("  [{step}] {line}");
        }
    }

    fn on_completion(&self, step: &str, status: Status) {
        let (icon, plain) = match status {
            Status::Succeeded => ("\x1b[32m✅\x1b[0m", "OK"),
            Status::Failed => ("\x1b[31m❌\x1b[0m", "FAILED"),
            Status::Skipped => ("\x1b[33m⏭\x1b[0m", "SKIPPED"),
            _ => ("•", "?"),
        };
        if self.color {
            println!("{icon} {step}");
        } else {
            println!("[{plain}] {step}");
        }
    }

    fn on_aborted(&self) {
        println!("\n⚠ run aborted");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "stc=info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let run_config = config::RunConfig::from_env();

    if let Some(title) = &run_config.title {
        print!("\x1b]0;{title}\x07");
    }

    let scenario = scenario::load(&cli.scenario_file)
        .with_context(|| format!("loading scenario {}", cli.scenario_file.display()))?;
    info!(scenario = %scenario.name, "loaded scenario");

    let (flow, log_dir) = match compiler::compile(&scenario) {
        Ok(compiled) => compiled,
        Err(e) => {
            error!("failed to compile scenario: {e}");
            eprintln!("❌ {e}");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Command::Run { range: Vec::new() }) {
        Command::Validate => {
            println!("✅ scenario '{}' compiled: {} steps", scenario.name, flow.steps().count());
            Ok(())
        }
        Command::List => {
            let coordinator = Coordinator::new(flow, log_dir, coordinator::default_worker_count(), processor::ProcessorConfig::default())?;
            for event in coordinator.get_records().await? {
                println!("{}\t{}\t{}", event.time_ms, event.step, event.status);
            }
            Ok(())
        }
        Command::ListFailed => {
            let coordinator = Coordinator::new(flow, log_dir, coordinator::default_worker_count(), processor::ProcessorConfig::default())?;
            for event in coordinator.get_failed_records().await? {
                println!("{}\t{}\t{}", event.time_ms, event.step, event.command.as_deref().unwrap_or(""));
            }
            Ok(())
        }
        Command::Run { range } => {
            let (from, to) = parse_range(&range);
            let coordinator = Coordinator::new(flow, log_dir, coordinator::default_worker_count(), processor::ProcessorConfig::default())?;
            coordinator.set_halt_on_error(run_config.halt_on_error).await;
            coordinator.add_listener(Arc::new(TracingListener));
            coordinator.add_listener(Arc::new(ConsoleListener {
                color: matches!(run_config.color, config::ColorMode::On | config::ColorMode::Dark | config::ColorMode::Light),
                dump_logs: run_config.dump_logs,
            }));

            if from.is_empty() && to.is_empty() {
                coordinator.reset().await?;
            } else {
                coordinator.reset_range(&from, &to).await?;
            }

            let ctrlc_target = Arc::clone(&coordinator);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrlc_target.abort().await;
                }
            });

            #[cfg(unix)]
            {
                let sigterm_target = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    use tokio::signal::unix::{signal, SignalKind};
                    if let Ok(mut term) = signal(SignalKind::terminate()) {
                        if term.recv().await.is_some() {
                            sigterm_target.abort().await;
                        }
                    }
                });
            }

            coordinator.start();
            let exit_code = coordinator.wait_for().await;

            if let Some(duration) = coordinator.duration().await {
                println!("\n🎯 finished in {:.2}s (exit code {exit_code})", duration.as_secs_f64());
            }

            std::process::exit(exit_code);
        }
    }
}
