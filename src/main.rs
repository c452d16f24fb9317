//! osintkb CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use osintkb::{
    commands::{
        cmd_gc, cmd_get, cmd_ingest_paths, cmd_init, cmd_list, cmd_query, cmd_rebuild,
        cmd_reindex, cmd_remove, cmd_status, cmd_verify, parse_document_id, print_document,
        print_document_ids, print_documents, print_ingest_stats, print_init, print_integrity,
        print_query_results, print_repair, print_status, IngestOptions, QueryOptions,
    },
    config::Config,
    error::Result,
    progress::LogWriterFactory,
    KnowledgeBase,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "osintkb")]
#[command(version, about = "Knowledge store and retrieval for cybersecurity documents", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "OSINTKB_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root (overrides the config file)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the stores
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that run against an opened knowledge base
#[derive(Subcommand)]
enum StoreCommand {
    /// Ingest text files or directories
    Ingest {
        /// Files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Document title (single file only; defaults to the file name)
        #[arg(short, long)]
        title: Option<String>,

        /// Source type, e.g. vulnerability, threat_intel, research
        #[arg(short, long)]
        source_type: Option<String>,

        /// File extensions to include when walking directories (e.g. md,txt)
        #[arg(long, value_delimiter = ',')]
        extensions: Option<Vec<String>>,
    },

    /// Search the knowledge base
    Query {
        /// The search query
        query: String,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Minimum similarity score
        #[arg(short, long)]
        min_score: Option<f32>,

        /// Metadata filter as key=value (repeatable)
        #[arg(short, long)]
        filter: Vec<String>,

        /// Keep only the best chunk per document
        #[arg(long)]
        dedupe: bool,

        /// BM25 weight in [0, 1] for hybrid ranking
        #[arg(long)]
        hybrid: Option<f32>,
    },

    /// Show a stored document and its chunks
    Get {
        /// Document ID (use 'osintkb list' to see them)
        document_id: String,
    },

    /// List stored documents
    List {
        /// Only documents of this source type
        #[arg(short, long)]
        source_type: Option<String>,

        /// Output only document IDs (one per line, for scripting)
        #[arg(long)]
        ids_only: bool,
    },

    /// Remove a document and its vectors
    Remove {
        /// Document ID
        document_id: String,
    },

    /// Re-chunk and re-embed stored documents
    Reindex {
        /// Document IDs (all documents when omitted)
        document_ids: Vec<String>,
    },

    /// Show knowledge base status
    Status,

    /// Check both stores for missing, altered or orphaned records
    Verify,

    /// Rebuild the document index and vector manifest from their payloads
    Rebuild,

    /// Delete vector payloads no manifest entry references
    Gc,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_config_path);

    let json = cli.json;
    let command = match cli.command {
        Commands::Init { force } => {
            let info = cmd_init(&config_path, cli.root.clone(), force).await?;
            return emit(json, &info, print_init);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "osintkb", &mut std::io::stdout());
            print_completion_extras(shell);
            return Ok(());
        }
        Commands::Store(command) => command,
    };

    let config = load_config(&config_path, cli.root.as_deref())?;
    let kb = KnowledgeBase::open(config).await?;
    run_store_command(&kb, command, config_path, json).await
}

async fn run_store_command(
    kb: &KnowledgeBase,
    command: StoreCommand,
    config_path: PathBuf,
    json: bool,
) -> Result<()> {
    match command {
        StoreCommand::Ingest {
            paths,
            title,
            source_type,
            extensions,
        } => {
            let options = IngestOptions {
                title,
                source_type,
                extensions,
            };
            let stats = cmd_ingest_paths(kb, &paths, options).await?;
            emit(json, &stats, |s| print_ingest_stats(s, "Ingestion complete"))?;
        }

        StoreCommand::Query {
            query,
            limit,
            min_score,
            filter,
            dedupe,
            hybrid,
        } => {
            let options = QueryOptions {
                k: limit,
                min_score,
                filters: filter,
                dedupe_docs: dedupe,
                hybrid_weight: hybrid,
            };
            let results = cmd_query(kb, &query, options).await?;
            emit(json, &results, print_query_results)?;
        }

        StoreCommand::Get { document_id } => {
            let id = parse_document_id(&document_id)?;
            let detail = cmd_get(kb, &id).await?;
            emit(json, &detail, print_document)?;
        }

        StoreCommand::List {
            source_type,
            ids_only,
        } => {
            let documents = cmd_list(kb, source_type.as_deref());
            if ids_only {
                print_document_ids(&documents);
            } else {
                emit(json, &documents, |d| print_documents(d))?;
            }
        }

        StoreCommand::Remove { document_id } => {
            let id = parse_document_id(&document_id)?;
            let info = cmd_remove(kb, &id).await?;
            emit(json, &info, |info| {
                println!(
                    "✓ Document '{}' removed ({} vectors)",
                    info.document_id, info.vectors_removed
                )
            })?;
        }

        StoreCommand::Reindex { document_ids } => {
            let ids = document_ids
                .iter()
                .map(|raw| parse_document_id(raw))
                .collect::<Result<Vec<_>>>()?;
            let stats = cmd_reindex(kb, ids).await?;
            emit(json, &stats, |s| print_ingest_stats(s, "Reindex complete"))?;
        }

        StoreCommand::Status => {
            let status = cmd_status(kb, config_path);
            emit(json, &status, print_status)?;
        }

        StoreCommand::Verify => {
            let integrity = cmd_verify(kb).await?;
            emit(json, &integrity, print_integrity)?;
            if !integrity.is_clean() {
                std::process::exit(2);
            }
        }

        StoreCommand::Rebuild => {
            let report = cmd_rebuild(kb).await?;
            emit(json, &report, print_repair)?;
        }

        StoreCommand::Gc => {
            let stats = cmd_gc(kb).await?;
            emit(json, &stats, |s| {
                println!("✓ Removed {} unreferenced files", s.files_removed)
            })?;
        }
    }

    Ok(())
}

/// Print as pretty JSON or through the human-readable printer
fn emit<T: Serialize + ?Sized>(json: bool, value: &T, print: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print(value);
    }
    Ok(())
}

fn load_config(config_path: &Path, root: Option<&Path>) -> Result<Config> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(root) = root {
        config.storage.root = root.to_path_buf();
    }
    config.validate()?;
    Ok(config)
}

fn print_completion_extras(shell: Shell) {
    match shell {
        Shell::Bash => {
            println!();
            println!("{}", r#"# Dynamic completion of document IDs for 'osintkb get/remove'"#);
            println!("{}", r#"_osintkb_dynamic() {"#);
            println!("{}", r#"    local cur="${COMP_WORDS[COMP_CWORD]}""#);
            println!("{}", r#"    local prev="${COMP_WORDS[COMP_CWORD-1]}""#);
            println!("{}", r#"    if [[ "$prev" == "get" || "$prev" == "remove" ]]; then"#);
            println!(
                "{}",
                r#"        COMPREPLY=( $(compgen -W "$(osintkb list --ids-only 2>/dev/null)" -- "$cur") )"#
            );
            println!("{}", r#"        return 0"#);
            println!("{}", r#"    fi"#);
            println!("{}", r#"    _osintkb "$@""#);
            println!("{}", r#"}"#);
            println!(
                "{}",
                r#"complete -F _osintkb_dynamic -o bashdefault -o default osintkb"#
            );
        }
        Shell::Zsh => {
            println!();
            println!("{}", r#"# Dynamic completion of document IDs for 'osintkb get/remove'"#);
            println!("{}", r#"_osintkb_document_ids() {"#);
            println!("{}", r#"    local -a ids"#);
            println!("{}", r#"    ids=("${(@f)$(osintkb list --ids-only 2>/dev/null)}")"#);
            println!("{}", r#"    _describe -t documents 'document ids' ids"#);
            println!("{}", r#"}"#);
            println!("{}", r#"compdef _osintkb_document_ids 'osintkb get' 'osintkb remove'"#);
        }
        Shell::Fish => {
            println!();
            println!("{}", r#"# Dynamic completion of document IDs for 'osintkb get/remove'"#);
            println!(
                "{}",
                r#"complete -c osintkb -n '__fish_seen_subcommand_from get remove' -a '(osintkb list --ids-only 2>/dev/null)'"#
            );
        }
        _ => {}
    }
}
