use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::api;
use crate::config::Config;
use crate::flowlog::analyzer::FlowAnalyzer;

/// Start the HTTP API server.
pub async fn serve(config_dir: PathBuf) -> Result<()> {
    let config = Config::load(&config_dir).context("Failed to load configuration")?;
    let state = api::build_state(config)
        .await
        .context("Failed to initialize service state")?;

    info!("Service initialized, starting server");
    api::serve(state).await.context("Server terminated with an error")?;
    Ok(())
}

/// Ingest local files into a knowledge base from the command line.
pub async fn ingest(
    config_dir: PathBuf,
    kb_id: String,
    paths: Vec<PathBuf>,
    force: bool,
) -> Result<()> {
    let config = Config::load(&config_dir).context("Failed to load configuration")?;
    let state = api::build_state(config)
        .await
        .context("Failed to initialize service state")?;

    let report = state
        .manager
        .ingest_paths(&kb_id, &paths, force)
        .await
        .context("Ingestion failed")?;

    println!("Ingestion finished in {:.2}s", report.total_seconds);
    println!("  Documents loaded: {}", report.documents_loaded);
    println!("  Chunks created:   {}", report.chunks_created);
    println!("  Vectors uploaded: {}", report.vectors_uploaded);
    if !report.failed_files.is_empty() {
        println!("  Failed files:");
        for file in &report.failed_files {
            println!("    - {file}");
        }
    }
    for error in &report.errors {
        println!("  Error: {error}");
    }
    Ok(())
}

/// Analyze the flow log: timing statistics, errors, slow operations, and
/// optional JSON/CSV export.
pub fn analyze_log(
    config_dir: PathBuf,
    session: Option<Uuid>,
    slow_threshold: f64,
    export: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = Config::load(&config_dir).context("Failed to load configuration")?;
    let analyzer =
        FlowAnalyzer::load(&config.flow_log_path()).context("Failed to read flow log")?;

    if let Some(format) = export {
        let rendered = match format.as_str() {
            "json" => analyzer.export_json()?,
            "csv" => analyzer.export_csv(),
            other => anyhow::bail!("unsupported export format '{other}' (expected json or csv)"),
        };
        match output {
            Some(path) => {
                std::fs::write(&path, rendered)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Exported {} event(s) to {}", analyzer.events().len(), path.display());
            }
            None => println!("{rendered}"),
        }
        return Ok(());
    }

    if let Some(session_id) = session {
        let events = analyzer.filter_session(session_id);
        println!("Session {session_id}: {} event(s)", events.len());
        for event in events {
            println!(
                "  [+{:.3}s] {} {} ({})",
                event.elapsed,
                event.event_type,
                event.status,
                event
                    .duration
                    .map(|d| format!("{d:.3}s"))
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        return Ok(());
    }

    println!("Sessions: {}", analyzer.sessions().len());
    println!("Events:   {}", analyzer.events().len());

    let stats = analyzer.timing_stats();
    if !stats.is_empty() {
        println!("\nTiming by event type:");
        println!(
            "  {:<16} {:>6} {:>9} {:>9} {:>9} {:>9}",
            "type", "count", "avg", "min", "max", "p95"
        );
        for (event_type, timing) in &stats {
            println!(
                "  {:<16} {:>6} {:>8.3}s {:>8.3}s {:>8.3}s {:>8.3}s",
                event_type, timing.count, timing.avg, timing.min, timing.max, timing.p95
            );
        }
    }

    let errors = analyzer.errors();
    if !errors.is_empty() {
        println!("\nErrors: {}", errors.len());
        for event in errors.iter().take(20) {
            let detail = event
                .metadata
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            println!("  [{}] {} {}", event.timestamp, event.event_type, detail);
        }
    }

    let slow = analyzer.slow_operations(slow_threshold);
    if !slow.is_empty() {
        println!("\nOperations slower than {slow_threshold:.1}s: {}", slow.len());
        for event in slow.iter().take(20) {
            println!(
                "  {} took {:.3}s (session {})",
                event.event_type,
                event.duration.unwrap_or_default(),
                event.session_id
            );
        }
    }

    Ok(())
}

/// Print the effective configuration.
pub fn show_config(config_dir: PathBuf) -> Result<()> {
    let config = Config::load(&config_dir).context("Failed to load configuration")?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("# configuration directory: {}", config_dir.display());
    println!("{rendered}");
    Ok(())
}
