//! Threadline: realtime thread and comment sync over PocketBase
//!
//! Subcommands:
//! - `threads`: list threads
//! - `watch`: follow a thread's comments live
//! - `comment` / `delete-comment`: post or remove a comment
//! - `resolve`: mark a thread resolved
//! - `notebook`: print an author's notebook

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "threadline")]
#[command(about = "Realtime thread and comment sync over PocketBase", long_about = None)]
struct Cli {
    /// PocketBase URL
    #[arg(long, global = true, env = "THREADLINE_PB_URL", default_value = "http://127.0.0.1:8090")]
    url: String,

    /// Pre-issued auth token, sent as the Authorization header
    #[arg(long, global = true, env = "THREADLINE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Records per page for list queries
    #[arg(long, global = true, default_value = "50")]
    per_page: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List threads, newest first
    Threads {
        /// Only show resolved threads
        #[arg(long)]
        resolved: bool,
    },

    /// Follow a thread's comments until Ctrl-C
    Watch {
        /// Thread record id
        thread_id: String,
    },

    /// Post a comment on a thread
    Comment {
        thread_id: String,
        author_id: String,
        content: String,
    },

    /// Delete a comment
    DeleteComment {
        /// Comment record id
        comment_id: String,
    },

    /// Mark a thread resolved
    Resolve { thread_id: String },

    /// Print an author's notebook
    Notebook { author_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "threadline=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pb = commands::connect(&cli.url, cli.token.as_deref());

    match cli.command {
        Commands::Threads { resolved } => commands::list_threads(&pb, cli.per_page, resolved).await,
        Commands::Watch { thread_id } => commands::watch_thread(&pb, &thread_id, cli.per_page).await,
        Commands::Comment {
            thread_id,
            author_id,
            content,
        } => commands::post_comment(&pb, &thread_id, &author_id, &content).await,
        Commands::DeleteComment { comment_id } => commands::delete_comment(&pb, &comment_id).await,
        Commands::Resolve { thread_id } => commands::resolve_thread(&pb, &thread_id).await,
        Commands::Notebook { author_id } => commands::show_notebook(&pb, &author_id).await,
    }
}
