//! Content History - local-first content history shared between replicas
//!
//! Every invocation is one replica over a directory of JSON documents.
//! Several processes pointing at the same directory stay in sync.

use anyhow::Result;
use clap::{Parser, Subcommand};
use content_history::{
    clock::SystemClock,
    config::HistoryConfig,
    history::{AnalyticsData, ContentType, EnhancedHistoryItem, NewCollection, NewHistoryItem, Rating},
    storage::FileStorage,
    HistoryService,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "content-history")]
#[command(version)]
#[command(about = "Local-first content history kept consistent across replicas")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONTENT_HISTORY_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory (overrides the configuration)
    #[arg(short, long, env = "CONTENT_HISTORY_DIR")]
    dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record generated content
    Add {
        /// Item title
        #[arg(short, long)]
        title: Option<String>,

        /// Item content
        content: String,

        /// Content type (text, image, video, analytics, strategy)
        #[arg(long = "type", default_value = "text")]
        content_type: ContentType,

        /// Target platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Performance score used by smart folders
        #[arg(long)]
        performance: Option<f64>,
    },

    /// List history items
    List {
        /// Only items in this smart folder
        #[arg(long)]
        folder: Option<String>,

        /// Only items in this collection
        #[arg(long)]
        collection: Option<String>,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Rate an item (1, -1 or 0)
    Rate {
        id: String,

        #[arg(allow_hyphen_values = true)]
        rating: i64,
    },

    /// Delete an item
    Delete { id: String },

    /// Show smart folders with their item counts
    Folders,

    /// List collections, or create one
    Collections {
        /// Create a collection with this name
        #[arg(long)]
        create: Option<String>,
    },

    /// Add an item to a collection
    Collect { collection_id: String, item_id: String },

    /// Show pending sync events
    Events,

    /// Follow changes written by other replicas until Ctrl+C
    Watch,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("content_history={}", log_level).into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => HistoryConfig::from_file(path)?,
        None => HistoryConfig::default(),
    };
    if let Some(dir) = cli.dir {
        config.storage.dir = dir;
    }

    if let Commands::Config { default } = cli.command {
        return show_config(if default { None } else { Some(&config) });
    }

    let storage = FileStorage::open(
        config.storage.dir.clone(),
        Duration::from_millis(config.storage.watch_interval_ms),
    )
    .await?;
    let service = HistoryService::new(config, Arc::new(storage), Arc::new(SystemClock)).await?;

    match cli.command {
        Commands::Add {
            title,
            content,
            content_type,
            platform,
            performance,
        } => {
            let item = NewHistoryItem {
                title,
                content: Some(content),
                content_type: Some(content_type),
                platform,
                analytics_data: performance.map(|performance| AnalyticsData {
                    performance,
                    ..Default::default()
                }),
                ..Default::default()
            };
            let id = service
                .track_content_generation(service.replica_id(), item)
                .await;
            if let Some(item) = service.get_item(&id).await {
                print_item(&item);
                if let Some(group) = &item.duplicate_group_id {
                    println!("  duplicate group: {}", group);
                }
            }
        }
        Commands::List {
            folder,
            collection,
            json,
        } => {
            let items = match (folder, collection) {
                (Some(folder), _) => service.items_in_folder(&folder).await,
                (None, Some(collection)) => service.collection_items(&collection).await,
                (None, None) => service.get_enhanced_history().await,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("No history items");
            } else {
                items.iter().for_each(print_item);
            }
        }
        Commands::Rate { id, rating } => {
            match service.update_rating(&id, Rating::from_i64(rating)).await {
                Some(item) => print_item(&item),
                None => anyhow::bail!("No history item with id {}", id),
            }
        }
        Commands::Delete { id } => {
            if !service.delete_history_item(&id).await {
                anyhow::bail!("No history item with id {}", id);
            }
            println!("Deleted {}", id);
        }
        Commands::Folders => {
            for folder in service.get_smart_folders().await {
                let mode = if folder.auto_organize { "auto" } else { "manual" };
                println!(
                    "{:<24} {:<24} {:>5} items ({})",
                    folder.id, folder.name, folder.item_count, mode
                );
            }
        }
        Commands::Collections { create } => {
            if let Some(name) = create {
                let collection = service
                    .create_custom_collection(NewCollection::named(name))
                    .await;
                println!("Created {} ({})", collection.name, collection.id);
            } else {
                for collection in service.get_custom_collections().await {
                    println!(
                        "{:<48} {:<24} {:>5} items",
                        collection.id,
                        collection.name,
                        collection.items.len()
                    );
                }
            }
        }
        Commands::Collect {
            collection_id,
            item_id,
        } => {
            if service.add_to_collection(&collection_id, &item_id).await {
                println!("Added {} to {}", item_id, collection_id);
            } else {
                println!("Nothing to do: unknown collection or item already present");
            }
        }
        Commands::Events => {
            let pruned = service.compact_now().await;
            if pruned > 0 {
                tracing::info!(pruned, "Pruned expired events");
            }
            for event in service.pending_events().await {
                println!(
                    "{}  {:<18} {:<40} from {}",
                    format_time(event.timestamp),
                    event.event_type,
                    event.id,
                    event.source_replica
                );
            }
        }
        Commands::Watch => run_watch(service).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

async fn run_watch(service: Arc<HistoryService>) -> Result<()> {
    let _history = service.subscribe(|items| {
        println!("history changed: {} items", items.len());
    });
    let _events = service.subscribe_sync("*", |event| {
        println!(
            "{}  {} from {}",
            format_time(event.timestamp),
            event.event_type,
            event.source_replica
        );
    });

    let handle = service.start();
    tracing::info!(replica_id = %service.replica_id(), "Watching for changes. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    handle.shutdown();
    Ok(())
}

fn print_item(item: &EnhancedHistoryItem) {
    let rating = match item.item.rating {
        Rating::Up => "+1",
        Rating::Down => "-1",
        Rating::Unrated => " 0",
    };
    println!(
        "{}  {}  [{}] {:<8} {} ({})",
        format_time(item.item.timestamp),
        rating,
        item.item.content_type,
        item.item.platform,
        item.item.title,
        item.item.id
    );
    if !item.smart_folders.is_empty() {
        println!("  folders: {}", item.smart_folders.join(", "));
    }
}

fn format_time(millis: u64) -> String {
    chrono::DateTime::from_timestamp_millis(millis as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn show_config(config: Option<&HistoryConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
