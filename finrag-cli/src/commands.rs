//! Subcommand handlers.

use chrono::NaiveDate;
use finrag_core::config::{RagConfig, load_config};
use finrag_core::gateway;
use finrag_core::{Document, Engine, IngestStatus, QueryOutcome, QueryRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Rehydrate the index from the store and start the HTTP gateway
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to bind
        #[arg(long)]
        port: Option<u16>,
    },
    /// Ingest one normalized filing text file
    Ingest {
        /// Path to the filing text
        file: PathBuf,
        /// Company name, e.g. Apple
        #[arg(long)]
        company: String,
        /// Fiscal year
        #[arg(long)]
        year: i32,
        /// Filing date (YYYY-MM-DD)
        #[arg(long)]
        filing_date: Option<NaiveDate>,
        /// URL or path the text came from (defaults to the file path)
        #[arg(long)]
        source: Option<String>,
    },
    /// Ask a question about one fiscal year
    Query {
        /// Question text
        text: String,
        /// Fiscal year to search
        #[arg(long)]
        year: i32,
        /// Number of sources to retrieve
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        /// Restrict to one company
        #[arg(long)]
        company: Option<String>,
        /// Restrict to one section
        #[arg(long)]
        section: Option<String>,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Embed stored chunks that have no vector from the configured embedding model
    Reembed,
    /// Show store counts and index figures
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List ingested documents
    Documents,
    /// Delete a document with its chunks and embeddings
    Delete {
        /// Document id
        id: Uuid,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a default config to .finrag/config.toml in the workspace
    Init,
    /// Print the effective merged configuration
    Show,
}

pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, config_path),
        Commands::Serve { host, port } => {
            let mut config = load(workspace, config_path)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let server = config.server.clone();
            let engine = Engine::open(config)?;
            println!("Serving on http://{}:{}", server.host, server.port);
            gateway::run(Arc::new(engine), &server).await?;
            Ok(())
        }
        Commands::Ingest {
            file,
            company,
            year,
            filing_date,
            source,
        } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;
            let mut document = Document::new(company, year, text)
                .with_source(source.unwrap_or_else(|| file.display().to_string()));
            if let Some(date) = filing_date {
                document = document.with_filing_date(date);
            }
            let engine = open(workspace, config_path)?;
            let report = engine.ingest(document).await?;
            match report.status {
                IngestStatus::Indexed => println!(
                    "Indexed {} (v{}): {} chunks in {}ms\n  id: {}",
                    report.label, report.version, report.chunks, report.elapsed_ms, report.document_id
                ),
                IngestStatus::Unchanged => println!(
                    "{} is unchanged ({} chunks already indexed)\n  id: {}",
                    report.label, report.chunks, report.document_id
                ),
            }
            Ok(())
        }
        Commands::Query {
            text,
            year,
            top_k,
            company,
            section,
            json,
        } => {
            let request = QueryRequest {
                query: text,
                year,
                top_k,
                company,
                section,
            };
            let response = open(workspace, config_path)?.query(&request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            println!("{}\n", response.answer);
            if response.outcome == QueryOutcome::NoSources {
                return Ok(());
            }
            println!(
                "Confidence: {:.2}  ({}ms via {}{})",
                response.confidence,
                response.processing_time_ms,
                response.provider.as_deref().unwrap_or("-"),
                if response.fallback_used { ", fallback" } else { "" }
            );
            println!("Sources:");
            for source in &response.sources {
                let section = match &source.subsection {
                    Some(sub) => format!("{} / {}", source.section, sub),
                    None => source.section.clone(),
                };
                println!(
                    "  [{}] {} {} (relevance {:.3}{})",
                    source.marker,
                    source.document,
                    section,
                    source.relevance_score,
                    if source.referenced { ", cited" } else { "" }
                );
                println!("      {}", source.snippet);
            }
            Ok(())
        }
        Commands::Stats { json } => {
            let stats = open(workspace, config_path)?.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            if let Some(store) = &stats.store {
                println!("Documents:   {} ({} completed)", store.documents, store.completed_documents);
                println!("Chunks:      {}", store.chunks);
                println!("Embeddings:  {}", store.embeddings);
                println!("Queries:     {}", store.queries);
            }
            println!(
                "Index:       {} live, {} tombstoned, {} levels",
                stats.index.live,
                stats.index.tombstones,
                stats.index.max_level + 1
            );
            Ok(())
        }
        Commands::Reembed => {
            let embedded = open(workspace, config_path)?.reembed().await?;
            if embedded == 0 {
                println!("Every stored chunk already has an embedding from this model.");
            } else {
                println!("Embedded and indexed {} chunks", embedded);
            }
            Ok(())
        }
        Commands::Documents => {
            let documents = open(workspace, config_path)?.documents();
            if documents.is_empty() {
                println!("No documents ingested.");
            }
            for doc in documents {
                println!(
                    "{}  {:<24} {}  v{}  {} chunks  {}",
                    doc.id,
                    doc.company,
                    doc.year,
                    doc.version,
                    doc.chunk_count,
                    doc.status
                );
            }
            Ok(())
        }
        Commands::Delete { id } => {
            let removed = open(workspace, config_path)?.delete_document(id).await?;
            println!("Deleted {} ({} chunks removed)", id, removed);
            Ok(())
        }
    }
}

fn load(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<RagConfig> {
    load_config(Some(workspace), config_path)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn open(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<Engine> {
    Ok(Engine::open(load(workspace, config_path)?)?)
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".finrag");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RagConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
