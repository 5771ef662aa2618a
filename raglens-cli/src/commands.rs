//! Subcommand definitions and handlers.

use anyhow::Context;
use raglens_core::config::load_config;
use raglens_core::diagnosis::Severity;
use raglens_core::engine::Engine;
use raglens_core::evaluator::EvaluateQueryRequest;
use raglens_core::runner::RunRequest;
use raglens_core::store::GoldenSetUpdate;
use raglens_core::types::{CaseStatus, EvaluationRun, NewTestCase};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Start the REST gateway
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Evaluate a stored query with the judge and retrieval metrics
    Evaluate {
        /// Id of the stored query
        query_id: Uuid,
        /// Ground-truth relevant document ids (repeatable)
        #[arg(short, long = "relevant")]
        relevant: Vec<String>,
        /// Compute retrieval metrics only
        #[arg(long)]
        no_judge: bool,
        /// Judge provider (defaults to the configured judge)
        #[arg(long)]
        provider: Option<String>,
    },
    /// Manage golden sets and run them
    GoldenSet {
        #[command(subcommand)]
        action: GoldenSetAction,
    },
    /// Quality diagnosis over the evaluation history
    Diagnose {
        #[command(subcommand)]
        action: DiagnoseAction,
    },
    /// Compare an expected and a generated answer claim by claim
    Compare {
        #[arg(long)]
        expected: String,
        #[arg(long)]
        generated: String,
        /// Judge provider (defaults to the configured judge)
        #[arg(long)]
        provider: Option<String>,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the merged configuration as TOML
    Show,
}

#[derive(clap::Subcommand, Debug)]
pub enum GoldenSetAction {
    /// Create an empty golden set
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// List golden sets
    List,
    /// Show one golden set with its cases
    Show { set_id: Uuid },
    /// Rename a set or change its description
    Update {
        set_id: Uuid,
        #[arg(long)]
        name: Option<String>,
        /// Pass an empty string to clear the description
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Append a test case
    AddCase {
        set_id: Uuid,
        #[arg(long)]
        query: String,
        #[arg(long)]
        expected: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        intent: Option<String>,
        /// Ground-truth relevant document ids (repeatable)
        #[arg(long = "relevant")]
        relevant: Vec<String>,
    },
    /// Run every case in the set and wait for the result
    Run {
        set_id: Uuid,
        /// Number of documents to retrieve per case
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        #[arg(short = 'n', long)]
        run_name: Option<String>,
        /// Generation provider
        #[arg(long)]
        provider: Option<String>,
        /// Judge provider
        #[arg(long)]
        evaluator: Option<String>,
    },
    /// List past runs of a set, newest first
    Runs { set_id: Uuid },
}

#[derive(clap::Subcommand, Debug)]
pub enum DiagnoseAction {
    /// Aggregate statistics and alerts
    Summary {
        #[arg(short, long)]
        days: Option<u32>,
    },
    /// Issues, actions and narrative
    Report {
        #[arg(short, long)]
        days: Option<u32>,
    },
    /// Alerts only, optionally filtered by severity
    Alerts {
        #[arg(short, long)]
        days: Option<u32>,
        /// high, medium or low
        #[arg(short, long)]
        severity: Option<String>,
    },
}

fn engine_for(workspace: &Path) -> anyhow::Result<Engine> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    Engine::from_config(config).map_err(|e| anyhow::anyhow!("Failed to start engine: {}", e))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => handle_serve(workspace, host, port).await,
        Commands::Config { action } => handle_config(action, workspace),
        Commands::Evaluate {
            query_id,
            relevant,
            no_judge,
            provider,
        } => {
            let engine = engine_for(workspace)?;
            let mut request = EvaluateQueryRequest::new(query_id);
            request.relevant_doc_ids = (!relevant.is_empty()).then_some(relevant);
            request.judge = !no_judge;
            request.evaluator_provider = provider;
            let record = engine.evaluator.evaluate_query(&request).await?;
            print_json(&record)?;
            engine.shutdown().await;
            Ok(())
        }
        Commands::GoldenSet { action } => handle_golden_set(action, workspace).await,
        Commands::Diagnose { action } => handle_diagnose(action, workspace).await,
        Commands::Compare {
            expected,
            generated,
            provider,
        } => {
            let engine = engine_for(workspace)?;
            let comparison = engine
                .evaluator
                .compare_claims(&expected, &generated, provider.as_deref())
                .await?;
            print_json(&comparison)?;
            engine.shutdown().await;
            Ok(())
        }
    }
}

async fn handle_serve(workspace: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    let gateway = config.gateway.clone();
    let engine = Engine::from_config(config).map_err(|e| anyhow::anyhow!("Failed to start engine: {}", e))?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        on_signal.cancel();
    });

    println!("RAGLens gateway on http://{}:{}", gateway.host, gateway.port);
    raglens_core::gateway::serve(&gateway, engine.app_state(), shutdown)
        .await
        .context("gateway failed")?;
    engine.shutdown().await;
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

async fn handle_golden_set(action: GoldenSetAction, workspace: &Path) -> anyhow::Result<()> {
    let engine = engine_for(workspace)?;
    match action {
        GoldenSetAction::Create { name, description } => {
            let set = engine.store.create_golden_set(&name, description).await?;
            println!("Created golden set '{}' ({})", set.name, set.id);
        }
        GoldenSetAction::List => {
            let sets = engine.store.list_golden_sets().await?;
            if sets.is_empty() {
                println!("No golden sets.");
            }
            for set in sets {
                println!(
                    "{}  {:<24} v{:<3} {} cases",
                    set.id,
                    set.name,
                    set.version,
                    set.cases.len()
                );
            }
        }
        GoldenSetAction::Show { set_id } => {
            let set = engine.store.require_golden_set(set_id).await?;
            print_json(&set)?;
        }
        GoldenSetAction::Update {
            set_id,
            name,
            description,
        } => {
            let update = GoldenSetUpdate { name, description };
            if update.is_empty() {
                anyhow::bail!("Nothing to update: pass --name or --description");
            }
            let set = engine.store.update_golden_set(set_id, update).await?;
            println!("Updated golden set '{}' (v{})", set.name, set.version);
        }
        GoldenSetAction::AddCase {
            set_id,
            query,
            expected,
            category,
            intent,
            relevant,
        } => {
            let case = engine
                .store
                .add_test_case(
                    set_id,
                    NewTestCase {
                        query,
                        expected_answer: expected,
                        category,
                        intent,
                        relevant_doc_ids: relevant,
                    },
                )
                .await?;
            println!("Added test case {}", case.id);
        }
        GoldenSetAction::Run {
            set_id,
            top_k,
            run_name,
            provider,
            evaluator,
        } => {
            let request = RunRequest {
                top_k,
                run_name,
                llm_provider: provider,
                evaluator_provider: evaluator,
            };
            let run = engine.runner.run_to_completion(set_id, request).await?;
            print_run(&run);
        }
        GoldenSetAction::Runs { set_id } => {
            let runs = engine.runner.list_runs(set_id).await?;
            if runs.is_empty() {
                println!("No runs for {}.", set_id);
            }
            for run in runs {
                println!(
                    "{}  {:<10} {}  {}/{} completed  avg {:.3}",
                    run.id,
                    run.status.to_string(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.summary.completed,
                    run.summary.total_cases,
                    run.summary.avg_score
                );
            }
        }
    }
    engine.shutdown().await;
    Ok(())
}

fn print_run(run: &EvaluationRun) {
    println!("Run {} {}", run.id, run.status);
    if let Some(reason) = &run.failure_reason {
        println!("  Reason: {}", reason);
    }
    println!("{}", "-".repeat(75));
    for result in &run.results {
        let outcome = match (result.status, &result.error_detail) {
            (CaseStatus::Success, _) => result
                .overall_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "-".into()),
            (CaseStatus::Error, Some(detail)) => format!("error: {}", detail.kind),
            (CaseStatus::Error, None) => "error".into(),
        };
        println!("  {:<56} {}", truncate(&result.query, 56), outcome);
    }
    println!("{}", "-".repeat(75));
    let summary = &run.summary;
    println!(
        "  {} cases, {} completed, {} failed, avg {:.3}, pass rate {:.1}%",
        summary.total_cases,
        summary.completed,
        summary.failed,
        summary.avg_score,
        summary.pass_rate * 100.0
    );
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

async fn handle_diagnose(action: DiagnoseAction, workspace: &Path) -> anyhow::Result<()> {
    let engine = engine_for(workspace)?;
    match action {
        DiagnoseAction::Summary { days } => {
            let summary = engine.diagnosis.summary(days).await?;
            print_json(&summary)?;
        }
        DiagnoseAction::Report { days } => {
            let report = engine.diagnosis.report(days).await?;
            println!("{}", report.headline);
            if let Some(narrative) = &report.narrative {
                println!("\n{}", narrative);
            }
            println!();
            print_json(&report)?;
        }
        DiagnoseAction::Alerts { days, severity } => {
            let severity = severity
                .map(|s| s.parse::<Severity>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let alerts = engine.diagnosis.alerts(days, severity).await?;
            if alerts.is_empty() {
                println!("No alerts.");
            }
            for alert in alerts {
                println!("[{}] {} ({} affected)", alert.severity, alert.message, alert.affected_count);
            }
        }
    }
    engine.shutdown().await;
    Ok(())
}
