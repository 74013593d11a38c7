use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;

use tasksync::journal::{EntityType, OutstandingJournal, SledJournal};
use tasksync::network::GrpcInvoker;
use tasksync::session::{AuthProvider, RefreshBroadcaster, SessionAuth, SyncGate};
use tasksync::storage::{apply_local_change, SledEntityStore};
use tasksync::sync::{SyncDeps, SyncEngine};
use tasksync::SyncConfig;

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "Offline-first task sync engine")]
struct Cli {
    /// JSON config file; TASKSYNC_* variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Directory holding the local database
    #[arg(short, long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync engine until Ctrl-C
    Run {
        /// Sync server address, e.g. 127.0.0.1:7000
        #[arg(short, long)]
        server: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Apply a local change and journal it for the next sync
    Record {
        /// Table name: tasks, tags, activity, attachments, task_list_metadata
        #[arg(short, long)]
        table: String,

        /// Local id of an existing row; a new row is created when omitted
        #[arg(short, long)]
        id: Option<i64>,

        #[arg(short = 'k', long)]
        column: String,

        /// JSON value, e.g. '"Buy milk"' or 'true'
        #[arg(short, long)]
        value: String,
    },

    /// List journal entries the server has not confirmed
    Outstanding {
        /// Restrict to one table
        #[arg(short, long)]
        table: Option<String>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("reading config {path}"))?,
        None => SyncConfig::default(),
    }
    .with_env_overrides();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn open_db(data_dir: &str) -> anyhow::Result<sled::Db> {
    let path = Path::new(data_dir);
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(sled::open(path.join("tasksync.sled"))?)
}

fn journaled_type(table: &str) -> anyhow::Result<EntityType> {
    match EntityType::from_table(table) {
        Some(ty) if EntityType::JOURNALED.contains(&ty) => Ok(ty),
        Some(ty) => bail!("{ty} is read-only"),
        None => bail!("unknown table '{table}'"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tasksync::logging::init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Run {
            server,
            timeout_secs,
        } => {
            if let Some(server) = server {
                config.server = server;
            }
            let db = open_db(&config.data_dir)?;
            let journal = Arc::new(SledJournal::new(&db)?);
            let store = Arc::new(SledEntityStore::new(&db));
            let invoker = Arc::new(
                GrpcInvoker::new(&config.server).with_timeout(Duration::from_secs(timeout_secs)),
            );
            let auth = Arc::new(SessionAuth::from_env());
            if !auth.is_authenticated() {
                log::warn!("TASKSYNC_AUTH_TOKEN is not set; changes stay local");
            }

            info!(
                "Starting sync against {} with data in {}",
                config.server, config.data_dir
            );
            let engine = SyncEngine::new(
                SyncDeps {
                    journal,
                    store,
                    invoker,
                    auth,
                    gate: Arc::new(SyncGate::new(config.sync_enabled)),
                    notifier: Arc::new(RefreshBroadcaster::new()),
                },
                config,
            );
            engine.start();

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            engine.shutdown().await;

            let status = engine.status().await;
            info!(
                "Sync status: round_trips={} restarts={} pending={} last_error={:?}",
                status.round_trips, status.restarts, status.pending_messages, status.last_error
            );
            db.flush_async().await?;
        }
        Command::Record {
            table,
            id,
            column,
            value,
        } => {
            let entity_type = journaled_type(&table)?;
            let value: serde_json::Value =
                serde_json::from_str(&value).with_context(|| format!("parsing value {value}"))?;

            let db = open_db(&config.data_dir)?;
            let journal = SledJournal::new(&db)?;
            let store = SledEntityStore::new(&db);
            let record =
                apply_local_change(&store, &journal, entity_type, id, &column, value).await?;
            println!("{}#{} {}", entity_type, record.id, serde_json::Value::Object(record.fields));
        }
        Command::Outstanding { table } => {
            let types = match table {
                Some(table) => vec![journaled_type(&table)?],
                None => EntityType::JOURNALED.to_vec(),
            };

            let db = open_db(&config.data_dir)?;
            let journal = SledJournal::new(&db)?;
            let mut total = 0;
            for entity_type in types {
                for entity_id in journal.query_distinct_entity_ids(entity_type).await? {
                    for entry in journal
                        .query_ordered_entries_for(entity_type, entity_id)
                        .await?
                    {
                        println!(
                            "{:>8}  {}#{}  {} = {}",
                            entry.sequence_id, entity_type, entity_id, entry.column, entry.value
                        );
                        total += 1;
                    }
                }
            }
            println!("{total} outstanding change(s)");
        }
    }

    Ok(())
}
