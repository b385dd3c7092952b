//! fieldsync - inspect and sync local partitions from the command line

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use fieldsync::record::{self, new_record_id};
use fieldsync::replication::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use fieldsync::transport::{CredentialProvider, SharedToken, StaticToken};
use fieldsync::{
    BearerAuth, HttpTransport, LocalStore, Order, Partition, ReferenceCache, RefreshOutcome,
    Replicator, RevisionRef, SyncConfig, Transport,
};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(author, version, about = "Local-first sync for field observation records")]
struct Cli {
    /// JSON config file; defaults and FIELDSYNC_* variables apply otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workstation (tenant) id selecting the partition
    #[arg(long, global = true, env = "FIELDSYNC_TENANT")]
    tenant: Option<String>,

    /// Directory for stores and checkpoints
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, global = true, env = "FIELDSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the winning revision of a document
    Get {
        id: String,
        /// A specific leaf revision instead of the winner
        #[arg(long)]
        rev: Option<RevisionRef>,
    },

    /// Write a document body (JSON)
    Put {
        /// Document id; a new UUID when omitted
        #[arg(long)]
        id: Option<String>,
        /// Revision the write is based on
        #[arg(long)]
        rev: Option<RevisionRef>,
        /// Base the write on the current winner
        #[arg(long, conflicts_with = "rev")]
        latest: bool,
        body: String,
    },

    /// Tombstone a document
    Delete {
        id: String,
        #[arg(long)]
        rev: Option<RevisionRef>,
    },

    /// List live documents
    Docs {
        #[arg(long)]
        descending: bool,
        /// Only occurrence records, newest first
        #[arg(long)]
        occurrences: bool,
    },

    /// Print change-log entries
    Changes {
        #[arg(long, default_value = "0")]
        since: u64,
        /// Keep waiting for new entries
        #[arg(long)]
        follow: bool,
    },

    /// List losing leaf revisions of a document
    Conflicts { id: String },

    /// Replicate with the backend
    Sync {
        /// Catch up once and exit instead of running live
        #[arg(long)]
        once: bool,
    },

    /// Fetch the reference dataset into the local cache
    RefreshReference,
}

struct Session {
    config: SyncConfig,
    store: LocalStore,
    partition: Arc<Partition>,
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = SyncConfig::load(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => SyncConfig::from_env(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(url) = &cli.backend_url {
        config.backend_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open(cli: &Cli) -> Result<Session> {
    let config = load_config(cli)?;
    let tenant = cli
        .tenant
        .as_deref()
        .context("a tenant is required (--tenant or FIELDSYNC_TENANT)")?;
    let store = match &config.data_dir {
        Some(dir) => LocalStore::open(dir, config.store.clone())
            .with_context(|| format!("opening store in {}", dir.display()))?,
        None => {
            log::warn!("no data directory configured; changes will not survive this process");
            LocalStore::in_memory(config.store.clone())
        }
    };
    let partition = store.partition(&config.partition_for(tenant)?)?;
    Ok(Session {
        config,
        store,
        partition,
    })
}

fn transport(cli: &Cli, config: &SyncConfig) -> Result<Arc<dyn Transport>> {
    let http = HttpTransport::new(
        &config.backend_url,
        &config.couchdb_path,
        config.replication.request_timeout(),
    )?;
    let credentials: Arc<dyn CredentialProvider> = match &cli.token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => {
            log::warn!("no token given; requests are sent without credentials");
            Arc::new(SharedToken::default())
        }
    };
    Ok(Arc::new(BearerAuth::new(http, credentials)))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let ctx = open(&cli)?;
    let partition = &ctx.partition;

    match &cli.command {
        Commands::Get { id, rev } => {
            let doc = match rev {
                Some(rev) => partition.get_revision(id, rev)?,
                None => partition.get(id)?,
            };
            print_json(&doc)?;
        }

        Commands::Put {
            id,
            rev,
            latest,
            body,
        } => {
            let body: Value = serde_json::from_str(body).context("body is not valid JSON")?;
            let id = id.clone().unwrap_or_else(new_record_id);
            let expected = match (rev, latest) {
                (Some(rev), _) => Some(partition.get_revision(&id, rev)?.revision),
                (None, true) => match partition.get(&id) {
                    Ok(doc) => Some(doc.revision),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e.into()),
                },
                (None, false) => None,
            };
            let revision = partition.put(&id, expected.as_ref(), body)?;
            println!("{} {}", id, revision);
        }

        Commands::Delete { id, rev } => {
            let current = match rev {
                Some(rev) => partition.get_revision(id, rev)?,
                None => partition.get(id)?,
            };
            let revision = partition.delete(id, &current.revision)?;
            println!("{} {} (deleted)", id, revision);
        }

        Commands::Docs {
            descending,
            occurrences,
        } => {
            if *occurrences {
                for (doc, occurrence) in record::occurrences(partition) {
                    let name = occurrence.scientific_name().unwrap_or_else(|| "-".to_string());
                    let issues = occurrence.validate().len();
                    println!("{}\t{}\t{}\t{} issue(s)", doc.id, doc.revision, name, issues);
                }
            } else {
                let order = if *descending { Order::Descending } else { Order::Ascending };
                for doc in partition.all_documents(order) {
                    println!("{}\t{}", doc.id, doc.revision);
                }
            }
        }

        Commands::Changes { since, follow } => {
            let mut feed = partition.subscribe(*since);
            loop {
                let batch = if *follow {
                    tokio::select! {
                        batch = feed.next_batch(100) => batch,
                        _ = tokio::signal::ctrl_c() => break,
                    }
                } else {
                    feed.try_next_batch(100)
                };
                if batch.is_empty() {
                    break;
                }
                for entry in batch {
                    let marker = if entry.deleted { " (deleted)" } else { "" };
                    println!("{}\t{}\t{}{}", entry.seq, entry.id, entry.revision, marker);
                }
            }
        }

        Commands::Conflicts { id } => {
            let winner = partition.resolve(id)?;
            println!("winner\t{}", winner.revision);
            for revision in partition.conflicts(id)? {
                println!("loser\t{}", revision);
            }
        }

        Commands::Sync { once } => {
            let checkpoints: Arc<dyn CheckpointStore> = match &ctx.config.data_dir {
                Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
                None => Arc::new(MemoryCheckpointStore::new()),
            };
            let replicator = Replicator::new(
                Arc::clone(partition),
                ctx.config.peer_id(),
                transport(&cli, &ctx.config)?,
                checkpoints,
                ctx.config.replication.clone(),
            );

            if *once || !ctx.config.replication.live {
                let summary = replicator.sync_once().await?;
                print_json(&summary)?;
            } else {
                let mut states = replicator.subscribe_state();
                replicator.start().await?;
                loop {
                    tokio::select! {
                        changed = states.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let state = *states.borrow_and_update();
                            println!("state: {}", state);
                            if matches!(state, fieldsync::ReplicationState::Error(class) if class.is_terminal()) {
                                break;
                            }
                        }
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
                let failed = replicator.state();
                replicator.stop().await?;
                let checkpoint = replicator.checkpoint();
                println!(
                    "stopped at push {} / pull {}",
                    checkpoint.last_pushed_seq, checkpoint.last_pulled_seq
                );
                if let fieldsync::ReplicationState::Error(class) = failed {
                    bail!("replication halted ({:?})", class);
                }
            }
        }

        Commands::RefreshReference => {
            let cache = ReferenceCache::new(
                Arc::clone(partition),
                transport(&cli, &ctx.config)?,
                ctx.config.reference.clone(),
            );
            match cache.refresh_quietly().await {
                RefreshOutcome::Updated => println!("reference data updated"),
                RefreshOutcome::Unchanged => println!("reference data unchanged"),
                RefreshOutcome::Failed(message) => bail!("reference refresh failed: {}", message),
            }
            if let Some(data) = cache.master_data()? {
                println!(
                    "{} languages, {} file types, {} user roles, {} workstation users",
                    data.languages.len(),
                    data.file_types.len(),
                    data.user_roles.len(),
                    data.workstation_users.len()
                );
            }
        }
    }

    log::debug!("open partitions: {:?}", ctx.store.open_partitions());
    Ok(())
}
