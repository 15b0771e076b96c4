use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::Duration;

use promotion_pipeline::artifact::ArtifactStore;
use promotion_pipeline::commands;
use promotion_pipeline::config::Config;
use promotion_pipeline::executor::ExecutorRegistry;
use promotion_pipeline::gate::ApprovalGate;
use promotion_pipeline::ledger::Ledger;
use promotion_pipeline::logging::{log, obj, v_str, Domain, Level};
use promotion_pipeline::model::{Decision, ExperimentId, InvocationId};
use promotion_pipeline::orchestrator::Orchestrator;
use promotion_pipeline::PipelineError;

#[derive(Parser)]
#[command(name = "pipeline", version, about = "Experiment orchestration and promotion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an experiment from a manifest file or a stored manifest id
    StartExperiment {
        #[arg(long)]
        manifest: String,
    },
    /// Show an experiment and its invocation history
    Status {
        #[arg(long)]
        experiment: String,
        #[arg(long)]
        json: bool,
    },
    /// Approve an invocation awaiting approval
    Approve {
        #[arg(long)]
        invocation: String,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Reject an invocation awaiting approval
    Reject {
        #[arg(long)]
        invocation: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Abort an experiment
    Cancel {
        #[arg(long)]
        experiment: String,
    },
    /// Run the control loop until interrupted
    Run {
        /// Stop once nothing is left to do
        #[arg(long)]
        once: bool,
        /// Upper bound for --once
        #[arg(long, default_value_t = 600)]
        max_wait_secs: u64,
    },
    /// List experiments
    List {
        #[arg(long)]
        json: bool,
    },
}

fn open_stores(cfg: &Config) -> Result<(Ledger, ArtifactStore)> {
    let ledger = Ledger::open(&cfg.db_path).with_context(|| format!("opening ledger {}", cfg.db_path))?;
    let store = ArtifactStore::open(&cfg.artifact_dir)
        .with_context(|| format!("opening artifact store {}", cfg.artifact_dir))?;
    Ok((ledger, store))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = Config::from_env();
    match cli.command {
        Command::StartExperiment { manifest } => {
            let (ledger, store) = open_stores(&cfg)?;
            let manifest_ref = commands::resolve_manifest_ref(&store, &manifest)?;
            let id = commands::start_experiment(&ledger, &store, &manifest_ref)?;
            println!("{id}");
        }
        Command::Status { experiment, json } => {
            let (ledger, _) = open_stores(&cfg)?;
            let exp = ledger.get_experiment(&ExperimentId::from(experiment))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&commands::status_json(&exp))?);
            } else {
                print!("{}", commands::render_status(&exp));
            }
        }
        Command::Approve { invocation, comment, actor } => {
            let (ledger, _) = open_stores(&cfg)?;
            let gate = ApprovalGate::new(Arc::new(ledger));
            let inv = gate.submit_approval(&InvocationId::from(invocation), Decision::Approved, &actor, comment)?;
            println!("{} {}", inv.id, inv.status);
        }
        Command::Reject { invocation, reason, actor } => {
            let (ledger, _) = open_stores(&cfg)?;
            let gate = ApprovalGate::new(Arc::new(ledger));
            let inv = gate.submit_approval(&InvocationId::from(invocation), Decision::Rejected, &actor, reason)?;
            println!("{} {}", inv.id, inv.status);
        }
        Command::Cancel { experiment } => {
            let (ledger, _) = open_stores(&cfg)?;
            let id = ExperimentId::from(experiment);
            let running = commands::cancel_experiment(&ledger, &id)?;
            println!("{id} aborted ({} running invocation(s) signalled)", running.len());
        }
        Command::List { json } => {
            let (ledger, _) = open_stores(&cfg)?;
            let experiments = ledger.list_experiments()?;
            if json {
                let rows: Vec<_> = experiments.iter().map(commands::status_json).collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", commands::render_list(&experiments));
            }
        }
        Command::Run { once, max_wait_secs } => {
            let executors = ExecutorRegistry::from_config(&cfg);
            for (stage, name) in executors.stages() {
                log(
                    Level::Info,
                    Domain::System,
                    "executor_bound",
                    obj(&[("stage", v_str(stage.as_str())), ("executor", v_str(&name))]),
                );
            }
            let mut orchestrator = Orchestrator::open(cfg, executors)?;
            if once {
                orchestrator.recover()?;
                let idle = orchestrator.run_until_idle(Duration::from_secs(max_wait_secs)).await?;
                if !idle {
                    anyhow::bail!("still busy after {max_wait_secs}s");
                }
            } else {
                orchestrator.run(shutdown_signal()).await?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too.
            return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .chain()
                .find_map(|e| e.downcast_ref::<PipelineError>())
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
