//! Datum Ingest CLI
//!
//! Runs JSON batches through the engine against an in-memory store and inspects
//! the identities datums would be stored under.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use datum_ingest::datum::fields;
use datum_ingest::{BatchOwner, IngestConfig, Ingestor, MemoryCollection, MemorySummarySink};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "datum-ingest")]
#[command(about = "Validate, identify and store device datums")]
struct Cli {
    /// Config file (defaults to ingest.toml and the usual locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a JSON batch into a fresh in-memory store
    Ingest {
        /// File holding a datum or an array of datums
        file: PathBuf,
        /// Group the batch is stored under
        #[arg(short, long, default_value = "local")]
        group_id: String,
        /// User owning the group (enables dedup hashes and summaries)
        #[arg(short, long)]
        user_id: Option<String>,
    },

    /// Print the id, _id and dedup hash each datum in a file is stored with
    Ids {
        file: PathBuf,
        #[arg(short, long, default_value = "local")]
        group_id: String,
        #[arg(short, long)]
        user_id: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref().map(|p| p.to_string_lossy().into_owned());
    let config = IngestConfig::load_from(config_path.as_deref()).context("loading configuration")?;
    config.validate()?;

    match cli.command {
        Commands::Ingest { file, group_id, user_id } => {
            let payload = read_payload(&file)?;
            let engine = Ingestor::new(MemoryCollection::new(), MemorySummarySink::new(), config)?;
            let owner = BatchOwner::new(group_id, user_id);

            let result = engine.ingest_value(&owner, payload).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_ok() {
                std::process::exit(2);
            }
            Ok(())
        }

        Commands::Ids { file, group_id, user_id } => {
            let engine = Ingestor::new(MemoryCollection::new(), MemorySummarySink::new(), config)?;
            let records = match read_payload(&file)? {
                Value::Array(records) => records,
                record @ Value::Object(_) => vec![record],
                _ => bail!("{} holds neither a datum nor an array of datums", file.display()),
            };

            // records go through the engine so ids and hashes reflect unit
            // normalization and references resolved earlier in the file
            let owner = BatchOwner::new(group_id, user_id);
            let mut rows = Vec::with_capacity(records.len());
            for (index, record) in records.into_iter().enumerate() {
                let outcome = engine
                    .ingest_record(&owner, record)
                    .await
                    .with_context(|| format!("record {}", index))?;
                if outcome.duplicate {
                    rows.push(json!({ "index": index, "duplicate": true }));
                }
                for stored in outcome.stored {
                    rows.push(json!({
                        "index": index,
                        "type": stored.get(fields::TYPE),
                        "id": stored.get(fields::ID),
                        "_id": stored.get(fields::INTERNAL_ID),
                        "hash": stored.get(fields::DEDUPLICATOR).and_then(|d| d.get("hash")),
                    }));
                }
            }
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }

        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn read_payload(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
