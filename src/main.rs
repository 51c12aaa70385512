use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use feedsync::core::cursor::CursorToken;
use feedsync::core::store::SqliteStore;
use feedsync::{Config, SyncClient};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and update a feedsync thread feed", long_about = None)]
struct Args {
    /// Act as this user (overrides FEEDSYNC_VIEWER and the config file)
    #[arg(short, long)]
    viewer: Option<String>,

    /// SQLite database to open (overrides FEEDSYNC_DB and the config file)
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one page of the feed as JSON
    Page {
        /// Rows per page; 0 uses the configured default
        #[arg(default_value_t = 0)]
        size: u32,
        /// Cursor from a previous page's `next_cursor`
        cursor: Option<String>,
    },
    /// Print a user's unread response total
    Unread {
        /// Defaults to the viewer
        user: Option<String>,
    },
    /// Print one thread's responses as JSON
    Thread { thread_id: i64 },
    /// Mark every response in a thread read for the viewer
    MarkRead { thread_id: i64 },
}

fn print_json<T: Serialize>(value: &T) -> feedsync::Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| feedsync::SyncError::Config(format!("serialize output: {e}")))?;
    println!("{out}");
    Ok(())
}

async fn run(args: Args) -> feedsync::Result<()> {
    let mut config = Config::resolve()?;
    if let Some(viewer) = args.viewer {
        config.viewer = viewer;
    }
    if let Some(db) = args.db {
        config.db_path = Some(db);
    }

    let path = config.db_path();
    log::info!("Opening {}", path.display());
    let store = SqliteStore::open(&path)?;
    let client = SyncClient::new(Arc::new(store), &config, config.viewer.clone());

    match args.command {
        Command::Page { size, cursor } => {
            let token = cursor.map(CursorToken::from);
            let view = client.fetch_page(size, token.as_ref()).await?;
            print_json(&view)
        }
        Command::Unread { user } => {
            let user = user.unwrap_or_else(|| client.viewer().to_string());
            let total = client.get_unread_total(&user).await?;
            print_json(&serde_json::json!({ "user": user, "unread": total }))
        }
        Command::Thread { thread_id } => print_json(&client.thread(thread_id).await?),
        Command::MarkRead { thread_id } => {
            if client.viewer().is_empty() {
                return Err(feedsync::SyncError::Config(
                    "mark-read needs a viewer (--viewer or FEEDSYNC_VIEWER)".into(),
                ));
            }
            let state = client.mark_thread_read(thread_id).await?;
            print_json(&serde_json::json!({ "thread_id": thread_id, "state": state }))
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{}", e);
        eprintln!("feedsync: {e}");
        std::process::exit(1);
    }
}
