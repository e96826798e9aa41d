use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::*;
use futures::{FutureExt, StreamExt};
use uuid::Uuid;

use dispatch_core::cancel::reasons;
use dispatch_core::cost::Preference;
use dispatch_core::events::DispatchEvent;
use dispatch_core::model::{AnalysisRequest, LogKind, Mode, TaskStatus};
use dispatch_core::status::{MessageLevel, StatusManager};

mod cli_args;
mod logging;
mod runtime;

use cli_args::{CliArgs, Commands};
use runtime::Runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let rt = Runtime::load(args.config.as_deref())
        .await
        .context("loading dispatch configuration")?;
    let _log_guard = logging::setup_logging(&rt.config.logging);
    if let Some(dir) = &rt.config.logging.dir {
        if let Ok(removed) = logging::purge_rolled_logs(dir, rt.config.logging.backups) {
            if removed > 0 {
                tracing::debug!(removed, "purged stale rolled log files");
            }
        }
    }

    match args.command {
        Commands::Analyze {
            file,
            kind,
            mode,
            provider,
            no_cache,
            priority,
        } => analyze(&rt, file, kind, mode, provider, no_cache, priority).await,
        Commands::Estimate {
            file,
            mode,
            budget,
            prefer,
        } => estimate(&rt, file, mode, budget, prefer).await,
        Commands::Status { analysis_id } => status(&rt, analysis_id).await,
        Commands::Cancel { analysis_id, reason } => cancel(&rt, analysis_id, reason).await,
    }
}

async fn analyze(
    rt: &Runtime,
    file: std::path::PathBuf,
    kind: String,
    mode: String,
    provider: Option<String>,
    no_cache: bool,
    priority: i32,
) -> Result<()> {
    let content = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    if content.len() as u64 > rt.config.max_file_size_bytes {
        return Err(anyhow!(
            "{} {} is {} bytes, exceeding the configured limit of {} bytes",
            "Error:".bright_red(),
            file.display(),
            content.len(),
            rt.config.max_file_size_bytes
        ));
    }
    let log_kind = LogKind::from_str(&kind).map_err(|e| anyhow!(e.to_string()))?;
    let analysis_mode = Mode::from_str(&mode).map_err(|e| anyhow!(e.to_string()))?;

    let mut request = AnalysisRequest::new(content, log_kind, analysis_mode);
    request.provider_hint = provider;
    request.use_cache = !no_cache;
    request.priority = priority;

    let status = Arc::new(StatusManager::default());
    let engine = rt.engine.clone();
    let cancellation = rt.cancellation.clone();

    let mut stream = Box::pin(engine.analyze(request, status));
    let mut running_id: Option<Uuid> = None;

    // `.fuse()` makes the future safe to poll again after it resolves once `select!`
    // has already consumed the interrupt (it then just returns `Pending` forever).
    let ctrl_c = tokio::signal::ctrl_c().fuse();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                match event {
                    DispatchEvent::Start { analysis_id } => {
                        running_id = Some(analysis_id);
                        eprintln!("{} analysis {}", "started".bright_blue(), analysis_id);
                    }
                    DispatchEvent::Content { text } => {
                        print!("{text}");
                    }
                    DispatchEvent::Progress { percent, chunks, tokens } => {
                        eprintln!(
                            "{} {:.1}% (chunk {}/{}, {} tokens processed)",
                            "progress:".bright_black(),
                            percent,
                            chunks.0,
                            chunks.1,
                            tokens.0
                        );
                    }
                    DispatchEvent::Message { level, text } => {
                        let tag = match level {
                            MessageLevel::Info => "info".normal(),
                            MessageLevel::Warning => "warning".yellow(),
                            MessageLevel::Error => "error".red(),
                            MessageLevel::Success => "ok".green(),
                            MessageLevel::Progress => "progress".bright_black(),
                        };
                        eprintln!("{tag}: {text}");
                    }
                    DispatchEvent::Cancelled { reason } => {
                        println!();
                        eprintln!("{} {}", "cancelled:".yellow(), reason);
                        return Ok(());
                    }
                    DispatchEvent::Error { kind, text } => {
                        println!();
                        eprintln!("{} {:?}: {}", "Error:".bright_red(), kind, text);
                        return Err(anyhow!("analysis failed"));
                    }
                    DispatchEvent::Complete { tokens_in, tokens_out, cost } => {
                        println!();
                        eprintln!(
                            "{} {} in / {} out tokens, ${:.4}",
                            "done:".bright_green(),
                            tokens_in,
                            tokens_out,
                            cost
                        );
                        return Ok(());
                    }
                }
            }
            _ = &mut ctrl_c => {
                if let Some(id) = running_id {
                    cancellation.cancel(id, reasons::USER_CANCELLED);
                }
                eprintln!("\n{} interrupt received, cancelling...", "!".yellow());
            }
        }
    }
    Ok(())
}

async fn estimate(
    rt: &Runtime,
    file: std::path::PathBuf,
    mode: String,
    budget: Option<f64>,
    prefer: String,
) -> Result<()> {
    let metadata = std::fs::metadata(&file).with_context(|| format!("reading {}", file.display()))?;
    let file_kb = metadata.len() as f64 / 1024.0;
    let analysis_mode = Mode::from_str(&mode).map_err(|e| anyhow!(e.to_string()))?;
    let preference = match prefer.to_ascii_lowercase().as_str() {
        "speed" => Preference::Speed,
        _ => Preference::Quality,
    };

    let estimates = rt.cost_calculator.compare(file_kb, analysis_mode, budget);
    if estimates.is_empty() {
        eprintln!("{} no providers registered", "!".yellow());
        return Ok(());
    }

    println!(
        "{:<12} {:<28} {:>10} {:>10} {:>10} {:>8} {:>8}",
        "provider", "model", "in toks", "out toks", "cost", "chunks", "minutes"
    );
    for e in &estimates {
        let cost_str = format!("${:.4}", e.cost);
        let cost_display = if e.within_budget {
            cost_str.green()
        } else {
            cost_str.red()
        };
        println!(
            "{:<12} {:<28} {:>10} {:>10} {:>10} {:>8} {:>8.1}",
            e.provider, e.model, e.tokens_in, e.tokens_out, cost_display, e.chunks_needed, e.est_time_minutes
        );
        for warning in &e.warnings {
            eprintln!("  {} {}", "!".yellow(), warning);
        }
    }

    if let Some(model) = rt.cost_calculator.recommend(file_kb, analysis_mode, budget, preference) {
        println!("\n{} {}", "recommended:".bright_cyan(), model);
    }
    Ok(())
}

async fn status(rt: &Runtime, analysis_id: String) -> Result<()> {
    let id = Uuid::parse_str(&analysis_id).context("analysis id must be a UUID")?;
    match rt.audit.get(id).await? {
        Some(record) => {
            println!("{} {}", "id:".bright_black(), record.analysis_id);
            println!("{} {:?}", "status:".bright_black(), record.status);
            println!("{} {}/{}", "provider/model:".bright_black(), record.provider, record.model);
            println!(
                "{} {} in / {} out tokens, ${:.4}",
                "usage:".bright_black(),
                record.input_tokens,
                record.output_tokens,
                record.cost_usd
            );
            if let Some(error) = &record.error {
                println!("{} {}", "error:".red(), error);
            }
            Ok(())
        }
        None => {
            eprintln!("{} no analysis found with id {}", "!".yellow(), analysis_id);
            Ok(())
        }
    }
}

async fn cancel(rt: &Runtime, analysis_id: String, reason: String) -> Result<()> {
    let id = Uuid::parse_str(&analysis_id).context("analysis id must be a UUID")?;

    if rt.cancellation.cancel(id, reason.clone()) {
        println!("{} cancellation requested for {}", "ok:".bright_green(), id);
        return Ok(());
    }

    // No live token for this id: either it already finished, or it was dispatched by a
    // different process invocation (this CLI does not persist in-memory state across
    // runs). Best effort: flag it cancelled in the audit trail if it's still Running.
    match rt.audit.get(id).await? {
        Some(record) if record.status == TaskStatus::Running => {
            rt.audit
                .finish(id, TaskStatus::Cancelled, record.input_tokens, record.output_tokens, record.cost_usd, Some(&reason))
                .await?;
            eprintln!(
                "{} no live process is dispatching {}; marked its audit record cancelled",
                "!".yellow(),
                id
            );
            Ok(())
        }
        Some(record) => {
            eprintln!("{} analysis {} is already {:?}", "!".yellow(), id, record.status);
            Ok(())
        }
        None => {
            eprintln!("{} no analysis found with id {}", "!".yellow(), id);
            Ok(())
        }
    }
}
