use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use deepbrief::config::{self, Config};
use deepbrief::models::{EventType, SearchMode, SourceKind};
use deepbrief::pipeline::StageSignal;
use deepbrief::providers::{
    EmbeddingService, Extractor, OpenAiEmbeddings, OpenAiGenerator, RelevanceScorer,
    TextFileExtractor, TextGenerator,
};
use deepbrief::{chunk, citation, db, events, ingest, migrate, pipeline, search, store, version};

#[derive(Parser)]
#[command(name = "brief", about = "Evidence store, hybrid retrieval, and versioned research documents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "brief.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema
    Init,

    /// Manage research runs
    #[command(subcommand)]
    Run(RunCommands),

    /// Manage sources within a run
    #[command(subcommand)]
    Source(SourceCommands),

    /// Ingest every pending source in a run
    Ingest {
        run_id: Uuid,
    },

    /// Search a run's evidence
    Search {
        run_id: Uuid,
        query: String,
        /// hybrid, vector, or keyword
        #[arg(short, long, default_value = "hybrid")]
        mode: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Resolve citation placeholders in a draft and print the result
    Resolve {
        run_id: Uuid,
        /// Path to the draft file
        draft: PathBuf,
    },

    /// Resolve a draft and publish it as the run's next document version
    Publish {
        run_id: Uuid,
        title: String,
        /// Path to the draft file
        draft: PathBuf,
        /// Required for every version after the first
        #[arg(long)]
        change_log: Option<String>,
    },

    /// Line diff between two published versions
    Diff {
        run_id: Uuid,
        from: i64,
        to: i64,
    },

    /// Record a review outcome for the latest version
    Review {
        run_id: Uuid,
        #[arg(long)]
        approve: bool,
        #[arg(long, default_value_t = 0)]
        issues: usize,
    },

    /// Resume an errored run from its latest checkpoint
    Resume {
        run_id: Uuid,
    },

    /// Show a run's event log, newest first
    Events {
        run_id: Uuid,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Start a new research run
    New {
        title: String,
        objective: String,
        /// JSON object of free-form constraints
        #[arg(long, default_value = "{}")]
        constraints: String,
    },
    /// Show one run
    Show { run_id: Uuid },
    /// List recent runs
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Delete a run and everything it owns
    Delete { run_id: Uuid },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Register a source for ingestion
    Add {
        run_id: Uuid,
        /// pdf, url, or note
        kind: String,
        title: String,
        /// Local file path or URL
        uri: String,
    },
    /// List a run's sources with ingestion status
    List { run_id: Uuid },
    /// Re-ingest a single failed source
    Retry { source_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    let pool = db::connect(&config).await?;
    migrate::run_migrations(&pool).await?;

    match cli.command {
        Commands::Init => {
            println!("Database ready at {}", config.db.path.display());
        }

        Commands::Run(cmd) => run_command(&pool, &config, cmd).await?,
        Commands::Source(cmd) => source_command(&pool, &config, cmd).await?,

        Commands::Ingest { run_id } => {
            let services = build_ingest_services(&config)?;
            pipeline::advance(&pool, run_id, StageSignal::IngestStarted).await?;

            let report = ingest::ingest_run(&pool, &config, &services, run_id).await?;
            let status = pipeline::advance(
                &pool,
                run_id,
                StageSignal::IngestFinished {
                    ingested: report.ingested,
                    failed: report.failed,
                },
            )
            .await?;

            println!(
                "Ingested {} source(s) ({} failed), {} chunk(s); prefixes {} ok / {} degraded; run is now '{}'",
                report.ingested,
                report.failed,
                report.chunks,
                report.context.prefixed,
                report.context.degraded,
                status.as_str()
            );
        }

        Commands::Search {
            run_id,
            query,
            mode,
            top_k,
        } => {
            let mode = SearchMode::parse(&mode)
                .with_context(|| format!("unknown search mode '{}'", mode))?;
            let embedder: Arc<dyn EmbeddingService> =
                Arc::new(OpenAiEmbeddings::new(&config.services)?);

            let results = match mode {
                SearchMode::Hybrid => {
                    let scorer = build_scorer(&config);
                    search::hybrid_search(&pool, &config, embedder, scorer, run_id, &query, top_k)
                        .await?
                }
                SearchMode::Vector => {
                    let k = top_k.unwrap_or(config.retrieval.top_k);
                    search::vector_search(&pool, embedder.as_ref(), run_id, &query, k).await?
                }
                SearchMode::Keyword => {
                    let k = top_k.unwrap_or(config.retrieval.top_k);
                    search::keyword_search(&pool, run_id, &query, k).await?
                }
            };

            if results.is_empty() {
                println!("No results.");
            }
            for (i, r) in results.iter().enumerate() {
                let location = r.location();
                println!(
                    "{:2}. [{:.4}] {} {} (chunk {} of {})",
                    i + 1,
                    r.score,
                    r.source_title,
                    location,
                    r.chunk_index,
                    r.chunk_id
                );
                let preview: String = r.content.chars().take(160).collect();
                println!("      {}", preview.replace('\n', " "));
            }
        }

        Commands::Resolve { run_id, draft } => {
            let text = std::fs::read_to_string(&draft)
                .with_context(|| format!("cannot read {}", draft.display()))?;
            let (resolution, citations) = citation::resolve_draft(&pool, run_id, &text).await?;

            println!("{}", resolution.body);
            let references = citation::render_references(&citations);
            if !references.is_empty() {
                println!("\n{}", references);
            }
            for issue in &resolution.issues {
                eprintln!("warning: {}", issue);
            }
            let report = citation::coverage(&resolution);
            eprintln!(
                "coverage: {}/{} sentence(s) cited, {} unresolved",
                report.cited_sentences, report.sentences, report.unresolved
            );
        }

        Commands::Publish {
            run_id,
            title,
            draft,
            change_log,
        } => {
            let text = std::fs::read_to_string(&draft)
                .with_context(|| format!("cannot read {}", draft.display()))?;
            let (resolution, citations) = citation::resolve_draft(&pool, run_id, &text).await?;

            let mut body = resolution.body;
            let references = citation::render_references(&citations);
            if !references.is_empty() {
                body.push_str("\n\n");
                body.push_str(&references);
            }

            let document = version::publish(
                &pool,
                run_id,
                &title,
                &body,
                change_log.as_deref(),
                &config.snapshot_json(),
            )
            .await?;
            citation::save_citations(&pool, document.id, &citations).await?;

            for issue in &resolution.issues {
                events::append(
                    &pool,
                    run_id,
                    EventType::Error,
                    Some("drafting"),
                    serde_json::json!({ "severity": "warning", "cause": issue }),
                )
                .await?;
                eprintln!("warning: {}", issue);
            }

            // Publishing outside the drafting stage stores the version but
            // leaves the run status alone.
            match pipeline::advance(
                &pool,
                run_id,
                StageSignal::DraftFinished {
                    document_id: document.id,
                },
            )
            .await
            {
                Ok(status) => println!(
                    "Published version {} ({}); run is now '{}'",
                    document.version,
                    document.id,
                    status.as_str()
                ),
                Err(_) => println!("Published version {} ({})", document.version, document.id),
            }
        }

        Commands::Diff { run_id, from, to } => {
            let diff = version::diff_versions(&pool, run_id, from, to).await?;
            if diff.is_empty() {
                println!("Versions {} and {} are identical.", from, to);
            } else {
                print!("{}", version::render_diff(&diff));
                println!("\n{}", diff.summary());
            }
        }

        Commands::Review {
            run_id,
            approve,
            issues,
        } => {
            pipeline::advance(&pool, run_id, StageSignal::ReviewStarted).await?;
            let status = pipeline::advance(
                &pool,
                run_id,
                StageSignal::ReviewFinished {
                    approved: approve,
                    issues,
                },
            )
            .await?;
            println!("Run is now '{}'", status.as_str());
        }

        Commands::Resume { run_id } => {
            let status = pipeline::resume(&pool, run_id).await?;
            println!("Run resumed into '{}'", status.as_str());
        }

        Commands::Events { run_id, limit } => {
            let events = events::list(&pool, run_id, limit).await?;
            for event in events {
                let stage = event.stage.as_deref().unwrap_or("-");
                println!(
                    "{}  {:11}  {:10}  {}",
                    event.ts,
                    event.event_type.as_str(),
                    stage,
                    event.payload_json
                );
            }
        }
    }

    Ok(())
}

async fn run_command(pool: &sqlx::SqlitePool, config: &Config, cmd: RunCommands) -> Result<()> {
    match cmd {
        RunCommands::New {
            title,
            objective,
            constraints,
        } => {
            // Constraints must at least parse as JSON.
            serde_json::from_str::<serde_json::Value>(&constraints)
                .context("constraints must be a JSON object")?;
            let run = store::create_run(
                pool,
                &title,
                &objective,
                &constraints,
                &config.snapshot_json(),
            )
            .await?;
            println!("Created run {}", run.id);
        }
        RunCommands::Show { run_id } => {
            let run = store::get_run(pool, run_id).await?;
            let chunk_count = store::count_run_chunks(pool, run_id).await?;
            let sources = store::list_sources(pool, run_id).await?;
            println!("Run {}", run.id);
            println!("  title:     {}", run.title);
            println!("  objective: {}", run.objective);
            println!("  status:    {}", run.status.as_str());
            println!("  sources:   {}", sources.len());
            println!("  chunks:    {}", chunk_count);
            if let Some(document) = version::latest(pool, run_id).await? {
                println!("  latest:    version {} ({})", document.version, document.id);
            }
            let documents = version::list_versions(pool, run_id).await?;
            let change_log = version::accumulate_change_log(&documents);
            if !change_log.is_empty() {
                println!("\n{}", change_log);
            }
        }
        RunCommands::List { limit } => {
            for run in store::list_runs(pool, limit).await? {
                println!("{}  {:10}  {}", run.id, run.status.as_str(), run.title);
            }
        }
        RunCommands::Delete { run_id } => {
            store::delete_run(pool, run_id).await?;
            println!("Deleted run {}", run_id);
        }
    }
    Ok(())
}

async fn source_command(
    pool: &sqlx::SqlitePool,
    config: &Config,
    cmd: SourceCommands,
) -> Result<()> {
    match cmd {
        SourceCommands::Add {
            run_id,
            kind,
            title,
            uri,
        } => {
            let kind =
                SourceKind::parse(&kind).with_context(|| format!("unknown source kind '{}'", kind))?;

            // Hash local file content when available so duplicate uploads
            // dedup; otherwise hash the locator.
            let content_hash = match std::fs::read_to_string(&uri) {
                Ok(content) => chunk::hash_text(&content),
                Err(_) => chunk::hash_text(&uri),
            };

            let source =
                store::create_source(pool, run_id, kind, &title, &uri, &content_hash, "{}").await?;
            println!("Source {} ({})", source.id, source.status.as_str());
        }
        SourceCommands::List { run_id } => {
            for source in store::list_sources(pool, run_id).await? {
                let error = source.error.as_deref().unwrap_or("");
                println!(
                    "{}  {:8}  {:5}  {}  {}",
                    source.id,
                    source.status.as_str(),
                    source.kind.as_str(),
                    source.title,
                    error
                );
            }
        }
        SourceCommands::Retry { source_id } => {
            let services = build_ingest_services(config)?;
            let report = ingest::retry_source(pool, config, &services, source_id).await?;
            println!(
                "Re-ingested source {}: {} chunk(s), prefixes {} ok / {} degraded",
                source_id, report.chunks, report.context.prefixed, report.context.degraded
            );
        }
    }
    Ok(())
}

fn build_ingest_services(config: &Config) -> Result<ingest::IngestServices> {
    let extractor: Arc<dyn Extractor> = Arc::new(TextFileExtractor::new());
    let embedder: Arc<dyn EmbeddingService> = Arc::new(OpenAiEmbeddings::new(&config.services)?);
    let generator: Option<Arc<dyn TextGenerator>> = if config.ingestion.contextual_prefixes {
        Some(Arc::new(OpenAiGenerator::new(&config.services)?))
    } else {
        None
    };
    Ok(ingest::IngestServices {
        extractor,
        embedder,
        generator,
    })
}

fn build_scorer(config: &Config) -> Option<Arc<dyn RelevanceScorer>> {
    if !config.retrieval.rerank {
        return None;
    }
    match deepbrief::providers::HttpReranker::new(&config.services) {
        Ok(reranker) => Some(Arc::new(reranker)),
        Err(_) => None,
    }
}
