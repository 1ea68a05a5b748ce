use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_context::db::{
    self, CacheRepo, ContextSettings, MessageRepo, SettingsRepo, SettingsSpec, UsageRepo,
};
use beacon_context::{Config, ContextBuilder, HistoryMessage, OpenAiSummarizer};

/// Beacon context - conversation compaction cache for AI assistants
#[derive(Parser)]
#[command(name = "beacon-context", version, about)]
struct Cli {
    /// Database path (overrides the configured location)
    #[arg(long, global = true, env = "BEACON_CONTEXT_DB")]
    db: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect and change settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Inspect and clear cached summaries
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Show usage for a community or conversation
    Stats(Scope),
    /// Manage the local message log
    #[command(subcommand)]
    Messages(MessagesCommand),
    /// Build and print context for a conversation
    Context {
        #[arg(long)]
        community: String,
        #[arg(long)]
        conversation: String,
    },
}

/// Community, optionally narrowed to one conversation
#[derive(Args)]
struct Scope {
    #[arg(long)]
    community: String,
    /// Omit for the community-wide value
    #[arg(long)]
    conversation: Option<String>,
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Show one resolved setting
    Get {
        #[command(flatten)]
        scope: Scope,
        key: String,
    },
    /// Store an override
    Set {
        #[command(flatten)]
        scope: Scope,
        key: String,
        value: String,
    },
    /// Remove an override
    Unset {
        #[command(flatten)]
        scope: Scope,
        key: String,
    },
    /// Show every setting and where its value comes from
    List {
        #[command(flatten)]
        scope: Scope,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached summaries in a community
    List {
        #[arg(long)]
        community: String,
    },
    /// Show one conversation's cached summary
    Show { conversation: String },
    /// Delete cached summaries
    Clear {
        /// Clear one conversation
        #[arg(long, conflicts_with = "community", required_unless_present = "community")]
        conversation: Option<String>,
        /// Clear every conversation in a community
        #[arg(long)]
        community: Option<String>,
    },
}

#[derive(Subcommand)]
enum MessagesCommand {
    /// Import messages from a JSON-lines file
    Import {
        #[arg(long)]
        conversation: String,
        /// One message object per line
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_context=info",
        1 => "info,beacon_context=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path.clone());
    let pool = db::init(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;

    match cli.command {
        Command::Settings(cmd) => settings(pool, cmd),
        Command::Cache(cmd) => cache(pool, cmd),
        Command::Stats(scope) => {
            let usage = UsageRepo::new(pool, Arc::new(config.pricing));
            let report = usage.stats(&scope.community, scope.conversation.as_deref())?;
            print!("{report}");
            Ok(())
        }
        Command::Messages(MessagesCommand::Import { conversation, file }) => {
            import_messages(pool, &conversation, &file)
        }
        Command::Context {
            community,
            conversation,
        } => build_context(pool, config, &community, &conversation).await,
    }
}

fn settings(pool: db::DbPool, cmd: SettingsCommand) -> anyhow::Result<()> {
    let repo = SettingsRepo::new(pool, Arc::new(SettingsSpec::default()));

    match cmd {
        SettingsCommand::Get { scope, key } => {
            let value = repo.get(&scope.community, scope.conversation.as_deref(), &key)?;
            println!("{key} = {value}");
        }
        SettingsCommand::Set { scope, key, value } => {
            let value = repo.set(&scope.community, scope.conversation.as_deref(), &key, &value)?;
            println!("Set {key} = {value}");
        }
        SettingsCommand::Unset { scope, key } => {
            if repo.unset(&scope.community, scope.conversation.as_deref(), &key)? {
                let value = repo.get(&scope.community, scope.conversation.as_deref(), &key)?;
                println!("Removed override; {key} is now {value}");
            } else {
                println!("No override for {key} at this level");
            }
        }
        SettingsCommand::List { scope } => {
            for setting in repo.describe(&scope.community, scope.conversation.as_deref())? {
                let bounds = repo
                    .spec()
                    .get(setting.key)
                    .map(|def| def.bounds())
                    .unwrap_or_default();
                println!(
                    "{:<22} {:<14} {:<13} {bounds}",
                    setting.key,
                    setting.value.to_string(),
                    setting.source.as_str(),
                );
            }
        }
    }

    Ok(())
}

fn cache(pool: db::DbPool, cmd: CacheCommand) -> anyhow::Result<()> {
    let repo = CacheRepo::new(pool);

    match cmd {
        CacheCommand::List { community } => {
            let entries = repo.list(&community)?;
            if entries.is_empty() {
                println!("No cached summaries for community {community}");
            }
            for entry in entries {
                println!(
                    "{:<22} {:>6} tokens  {}..{}  {}  {}",
                    entry.conversation_id,
                    entry.token_count,
                    entry.oldest_id,
                    entry.newest_id,
                    entry.model_used,
                    entry.updated_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }
        CacheCommand::Show { conversation } => match repo.get(&conversation)? {
            Some(entry) => {
                println!("conversation: {}", entry.conversation_id);
                println!("community:    {}", entry.community_id);
                println!(
                    "range:        {} ({}) .. {} ({})",
                    entry.oldest_id,
                    entry.oldest_id.timestamp().to_rfc3339(),
                    entry.newest_id,
                    entry.newest_id.timestamp().to_rfc3339(),
                );
                println!("model:        {}", entry.model_used);
                println!("tokens:       {}", entry.token_count);
                println!("created:      {}", entry.created_at.to_rfc3339());
                println!("updated:      {}", entry.updated_at.to_rfc3339());
                println!("\n{}", entry.summary_text);
            }
            None => println!("No cached summary for conversation {conversation}"),
        },
        CacheCommand::Clear {
            conversation,
            community,
        } => {
            if let Some(conversation) = conversation {
                let removed = repo.delete(&conversation)?;
                println!(
                    "{} cached summary for conversation {conversation}",
                    if removed { "Deleted" } else { "No" }
                );
            } else if let Some(community) = community {
                let removed = repo.delete_all(&community)?;
                println!("Deleted {removed} cached summaries in community {community}");
            }
        }
    }

    Ok(())
}

fn import_messages(pool: db::DbPool, conversation: &str, file: &Path) -> anyhow::Result<()> {
    let repo = MessageRepo::new(pool);
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );

    let mut imported = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let message: HistoryMessage = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid message", file.display(), index + 1))?;
        repo.record(conversation, &message)?;
        imported += 1;
    }

    let newest = repo
        .newest_id(conversation)?
        .map_or_else(|| "none".to_string(), |id| id.to_string());
    println!(
        "Imported {imported} messages into {conversation} ({} stored, newest id {newest})",
        repo.count(conversation)?
    );

    Ok(())
}

async fn build_context(
    pool: db::DbPool,
    config: Config,
    community: &str,
    conversation: &str,
) -> anyhow::Result<()> {
    let settings = SettingsRepo::new(pool.clone(), Arc::new(SettingsSpec::default()));
    let settings =
        ContextSettings::from_resolved(&settings.get_all(community, Some(conversation))?)?;

    let summarizer = OpenAiSummarizer::new(&config.provider)?;
    let builder = ContextBuilder::new(
        Arc::new(MessageRepo::new(pool.clone())),
        Arc::new(summarizer),
        CacheRepo::new(pool.clone()),
        UsageRepo::new(pool, Arc::new(config.pricing)),
    )
    .with_config(config.compaction);

    let context = builder.build(conversation, community, &settings).await?;
    tracing::info!(
        kind = context.kind.as_str(),
        tokens = context.estimated_tokens,
        "context built"
    );

    println!("{}", context.text);
    Ok(())
}
