//! CLI subcommand handlers.

use anyhow::Context;
use docqa_core::config::{QaConfig, load_config, load_config_file, workspace_config_path};
use docqa_core::embeddings::create_embedder;
use docqa_core::progress::ChannelSink;
use docqa_core::{
    Corpus, Embedder, PipelineBuilder, PipelineRun, ProgressEvent, ProgressStatus, RetrievalRequest,
    RetrievalStage, RunStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Options shared by every subcommand.
#[derive(Debug)]
pub struct GlobalOptions {
    pub workspace: PathBuf,
    pub config: Option<PathBuf>,
    pub quiet: bool,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Answer a question from the documentation corpus
    Ask {
        question: String,

        /// Corpus file (JSON array or JSON Lines); defaults to `corpus.path`
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Maximum generate-and-evaluate iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Expand broad questions into several retrieval queries
        #[arg(long)]
        expand: bool,

        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run hybrid retrieval only and list the fused results
    Search {
        query: String,

        #[arg(long)]
        corpus: Option<PathBuf>,

        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration into the workspace
    Init,
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, options: &GlobalOptions) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            question,
            corpus,
            max_iterations,
            expand,
            json,
        } => {
            let mut config = resolve_config(options)?;
            if let Some(max) = max_iterations {
                config.gate.max_iterations = max;
            }
            if expand {
                config.retrieval.query_expansion = true;
            }
            handle_ask(&question, corpus, config, json, options.quiet).await
        }
        Commands::Search {
            query,
            corpus,
            top_k,
        } => handle_search(&query, corpus, resolve_config(options)?, top_k).await,
        Commands::Config { action } => handle_config(action, options),
    }
}

fn resolve_config(options: &GlobalOptions) -> anyhow::Result<QaConfig> {
    let config = match &options.config {
        Some(path) => load_config_file(path),
        None => load_config(Some(&options.workspace), None),
    };
    config.map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

async fn load_corpus(path: Option<PathBuf>, config: &QaConfig) -> anyhow::Result<Corpus> {
    let path = path
        .or_else(|| config.corpus.path.clone())
        .context("No corpus given; pass --corpus or set corpus.path in the configuration")?;
    let embedder = create_embedder(&config.embedding)?;
    let corpus = Corpus::load(&path, embedder.as_ref())
        .await
        .with_context(|| format!("Failed to load corpus from {}", path.display()))?;
    tracing::info!(path = %path.display(), documents = corpus.len(), "Corpus loaded");
    if corpus.is_empty() {
        anyhow::bail!("Corpus at {} contains no documents", path.display());
    }
    Ok(corpus)
}

async fn handle_ask(
    question: &str,
    corpus: Option<PathBuf>,
    config: QaConfig,
    json: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let corpus = load_corpus(corpus, &config).await?;
    let pipeline = PipelineBuilder::from_config(config)?.corpus(&corpus).build()?;

    let (sink, rx) = ChannelSink::channel();
    let printer = tokio::spawn(print_progress(rx, quiet || json));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            eprintln!("\n  Cancelling...");
            on_interrupt.cancel();
        }
    });

    let run = pipeline
        .answer_with_progress(question, Arc::new(sink), cancel)
        .await;
    if let Err(e) = printer.await {
        tracing::warn!("Progress printer stopped: {}", e);
    }
    tracing::info!(
        run_id = %run.id,
        status = %run.status,
        cost_usd = run.total_cost_usd,
        duration_ms = run.total_duration_ms,
        "Run finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }

    match run.status {
        RunStatus::Failed => {
            let reason = run
                .failure
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            tracing::error!(run_id = %run.id, "Run failed: {}", reason);
            anyhow::bail!("Run failed: {}", reason)
        }
        RunStatus::Accepted | RunStatus::Exhausted => Ok(()),
    }
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if quiet || event.status == ProgressStatus::Finished {
            continue;
        }
        let marker = match event.status {
            ProgressStatus::Started => "..",
            ProgressStatus::Completed => "ok",
            ProgressStatus::Degraded => "!!",
            ProgressStatus::Failed => "xx",
            ProgressStatus::Finished => "",
        };
        eprintln!(
            "  [{:>3.0}%] {} {}: {} (${:.4})",
            event.progress * 100.0,
            marker,
            event.stage,
            event.message,
            event.cost_so_far
        );
    }
}

fn print_run(run: &PipelineRun) {
    if let Some(answer) = &run.answer {
        println!("\n{}\n", answer);
    }

    if !run.sources.is_empty() {
        println!("  Sources:");
        for (i, source) in run.sources.iter().take(5).enumerate() {
            println!(
                "  {}. {} ({})",
                i + 1,
                source.document.title,
                source.document.source
            );
        }
        println!();
    }

    let verified = run.claims.iter().filter(|c| c.verified).count();
    println!("  Status:     {}", run.status);
    if run.below_threshold {
        println!("  Note:       answer did not clear the quality gate");
    }
    if let Some(quality) = run.quality_score {
        println!("  Quality:    {:.1}", quality);
    }
    if let Some(accuracy) = run.accuracy_score {
        println!("  Accuracy:   {:.0}", accuracy);
    }
    println!("  Claims:     {}/{} verified", verified, run.claims.len());
    println!("  Iterations: {}", run.evaluations.len());
    println!(
        "  Cost:       ${:.4} in {:.1}s",
        run.total_cost_usd,
        run.total_duration_ms as f64 / 1000.0
    );
}

async fn handle_search(
    query: &str,
    corpus: Option<PathBuf>,
    config: QaConfig,
    top_k: usize,
) -> anyhow::Result<()> {
    let corpus = load_corpus(corpus, &config).await?;
    let embedder = create_embedder(&config.embedding)?;
    let retrieval = RetrievalStage::new(
        corpus.vector_index(),
        corpus.lexical_index(),
        &config.retrieval,
    );

    let embedding = embedder.embed(query).await?;
    let outcome = retrieval
        .retrieve(RetrievalRequest {
            query,
            embedding: &embedding.vector,
            top_k: top_k.max(1),
            similarity_floor: config.retrieval.similarity_floor,
        })
        .await?;

    if let Some(source) = outcome.single_source {
        tracing::warn!(source = %source, "Search degraded to a single source");
        eprintln!("  Only {} search answered; results are single-source.", source);
    }
    if outcome.results.is_empty() {
        println!("  No documents matched.");
        return Ok(());
    }
    for (i, result) in outcome.results.iter().enumerate() {
        let rank = |r: Option<usize>| r.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "  {}. {} [{}] score {:.4} sim {:.2} (semantic #{}, lexical #{})",
            i + 1,
            result.document.title,
            result.document.id,
            result.combined_score,
            result.similarity,
            rank(result.semantic_rank),
            rank(result.lexical_rank),
        );
    }
    Ok(())
}

fn handle_config(action: ConfigAction, options: &GlobalOptions) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = resolve_config(options)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
        ConfigAction::Init => init_config(&options.workspace),
    }
}

fn init_config(workspace: &Path) -> anyhow::Result<()> {
    let config_path = workspace_config_path(workspace);
    if config_path.exists() {
        println!(
            "Configuration file already exists at: {}",
            config_path.display()
        );
        return Ok(());
    }
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let toml_str = toml::to_string_pretty(&QaConfig::default())?;
    std::fs::write(&config_path, &toml_str)?;
    println!(
        "Created default configuration at: {}",
        config_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        init_config(dir.path()).unwrap();

        let path = workspace_config_path(dir.path());
        assert!(path.exists());
        let loaded = load_config_file(&path).unwrap();
        assert_eq!(loaded, QaConfig::default());

        // a second init leaves the file alone
        std::fs::write(&path, "[gate]\nmax_iterations = 4\n").unwrap();
        init_config(dir.path()).unwrap();
        assert_eq!(load_config_file(&path).unwrap().gate.max_iterations, 4);
    }

    #[test]
    fn test_explicit_config_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[retrieval]\ntop_k = 3\n").unwrap();

        let options = GlobalOptions {
            workspace: dir.path().to_path_buf(),
            config: Some(path),
            quiet: true,
        };
        assert_eq!(resolve_config(&options).unwrap().retrieval.top_k, 3);

        let missing = GlobalOptions {
            config: Some(dir.path().join("nope.toml")),
            ..options
        };
        assert!(resolve_config(&missing).is_err());
    }
}
