//! glossator CLI
//! -------------
//! Annotates one or more UTF-8 text files with the medieval taxonomy and
//! writes inline XML, Parquet and JSON outputs per file.
//!
//! Console logging is verbose so a run can be followed step by step.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use glossator::openai::DEFAULT_MODEL;
use glossator::{Annotator, OpenAiClient, RunStatus};

#[derive(Debug, Parser)]
#[command(
    name = "glossator",
    version,
    about = "Annotate medieval Spanish and Catalan texts with a language model"
)]
struct Cli {
    /// Input UTF-8 text files
    #[arg(long, value_name = "FILE", required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Output directory
    #[arg(long, value_name = "DIR", default_value = "./out")]
    out_dir: PathBuf,

    /// OpenAI model ID
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Settings file (TOML); GLOSSATOR__* variables override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Max characters per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Characters re-read from the end of the previous chunk
    #[arg(long)]
    overlap: Option<usize>,

    /// Attempts per chunk, including the first
    #[arg(long)]
    max_retries: Option<u32>,

    /// Max requests in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let api_key = std::env::var("OPENAI_API_KEY")
        .context("Missing OPENAI_API_KEY env var. Set it before running.")?;

    let mut cfg =
        glossator::config::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(size) = cli.chunk_size {
        cfg.max_chunk_size = size;
    }
    if let Some(overlap) = cli.overlap {
        cfg.chunk_overlap = overlap;
    }
    if let Some(attempts) = cli.max_retries {
        cfg.retry.max_attempts = attempts;
    }
    if let Some(concurrency) = cli.concurrency {
        cfg.max_concurrency = concurrency;
    }
    if let Some(secs) = cli.timeout_seconds {
        cfg.retry.call_timeout = Duration::from_secs(secs);
    }

    let mut texts = Vec::with_capacity(cli.input.len());
    for path in &cli.input {
        info!("📄 Reading input file: {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} as UTF-8", path.display()))?;
        texts.push(text);
    }

    let client = OpenAiClient::new(api_key, cli.model, cfg.retry.call_timeout)
        .context("Failed to build annotation client")?;
    info!("🧠 Model: {}", client.model());
    info!(
        "⚙️  ChunkSize={}, Overlap={}, Concurrency={}, Attempts={}",
        cfg.max_chunk_size, cfg.chunk_overlap, cfg.max_concurrency, cfg.retry.max_attempts
    );

    let max_chunk_size = cfg.max_chunk_size;
    let annotator = Arc::new(Annotator::new(Arc::new(client), cfg));

    {
        let annotator = Arc::clone(&annotator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, finishing in-flight requests");
                annotator.cancel();
            }
        });
    }

    let pb = ProgressBar::new(texts.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("=>-"),
    );
    pb.set_message("annotating…");

    let results = annotator
        .annotate_many_with(&texts, max_chunk_size, |_, result| {
            pb.inc(1);
            pb.set_message(format!("{} annotations", result.total_annotations()));
        })
        .await;
    pb.finish_with_message("done");

    let mut bases = HashSet::new();
    let mut failures = 0usize;
    for (i, (path, result)) in cli.input.iter().zip(&results).enumerate() {
        let stats = result.statistics();
        match stats.status {
            RunStatus::Failed => {
                failures += 1;
                error!(
                    "❌ {}: {}",
                    path.display(),
                    stats.error.as_deref().unwrap_or("annotation failed")
                );
                continue;
            }
            RunStatus::Partial => warn!(
                "⚠️ {}: chunks {:?} failed",
                path.display(),
                stats.failed_chunks
            ),
            RunStatus::Annotated | RunStatus::NoAnnotations => {}
        }

        let base = output_base(path, i, &mut bases);
        let paths = annotator
            .write_outputs(result, &cli.out_dir, &base)
            .with_context(|| format!("Failed to write outputs for {}", path.display()))?;
        info!(
            "📦 {} → {} annotations in {:.2}s",
            path.display(),
            stats.total_annotations,
            stats.processing_time
        );
        info!("  • XML:     {}", paths.markup.display());
        info!("  • Parquet: {}", paths.parquet.display());
        info!("  • JSON:    {}", paths.record.display());
    }

    if annotator.is_cancelled() {
        bail!("run cancelled");
    }
    if failures == results.len() {
        bail!("no input could be annotated");
    }
    info!("✅ All done.");
    Ok(())
}

/// File stem of `path`, suffixed with the input index when two inputs share one.
fn output_base(path: &Path, index: usize, seen: &mut HashSet<String>) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| "input".to_string());
    let base = if seen.contains(&stem) {
        format!("{stem}-{index}")
    } else {
        stem
    };
    seen.insert(base.clone());
    base
}
