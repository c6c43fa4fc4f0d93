//! Subcommand implementations.

use miette::Result;
use threadline_pb::{
    Comment, CommentValues, ConnectionStatus, Filter, ListOptions, Notebook, PocketBase,
    PocketBaseClient, Thread, ThreadValues,
};
use threadline_sync::{
    CachedCollection, ListParams, ListSnapshot, QueryCache, RealtimeListResource,
};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

pub fn connect(url: &str, token: Option<&str>) -> PocketBase {
    let mut builder = PocketBaseClient::builder(url);
    if let Some(token) = token {
        builder = builder.auth_token(token);
    }
    debug!(url, authenticated = token.is_some(), "connecting to PocketBase");
    PocketBase::new(builder.build())
}

pub async fn list_threads(pb: &PocketBase, per_page: u32, resolved_only: bool) -> Result<()> {
    let cache = QueryCache::new();
    let threads: CachedCollection<Thread, _> = cache.collection(pb.threads());

    let mut options = ListOptions::new().sort("-created").expand("author");
    if resolved_only {
        let filter = Filter::new("resolved = {:resolved}")
            .bind("resolved", true)
            .render();
        options = options.filter(filter);
    }

    let page = threads
        .get_list(1, per_page, &options)
        .await
        .map_err(|e| miette::miette!("failed to list threads: {}", e))?;

    info!(shown = page.items.len(), total = page.total_items, "listed threads");
    for thread in &page.items {
        println!("{}", format_thread(thread));
    }
    Ok(())
}

pub async fn watch_thread(pb: &PocketBase, thread_id: &str, per_page: u32) -> Result<()> {
    let filter = Filter::new("thread = {:threadId}")
        .bind("threadId", thread_id)
        .render();
    let params = ListParams::new()
        .filter(filter)
        .sort("created")
        .expand("author")
        .per_page(per_page);

    let resource: RealtimeListResource<Comment, _> =
        RealtimeListResource::open(pb.comments(), params);
    resource
        .load()
        .await
        .map_err(|e| miette::miette!("failed to load comments: {}", e))?;
    print_comments(&resource.snapshot());

    let mut snapshots = WatchStream::from_changes(resource.watch());
    let mut connection = WatchStream::from_changes(resource.connection());
    let mut was_connected = true;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(thread = thread_id, "watching comments, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
            Some(snapshot) = snapshots.next() => {
                info!(comments = snapshot.total_items, "comments changed");
                print_comments(&snapshot);
            }
            Some(status) = connection.next() => {
                info!(?status, "realtime connection changed");
                // Events sent while disconnected are lost, so resync on reconnect
                if status == ConnectionStatus::Connected && !was_connected {
                    if let Err(e) = resource.fetch().await {
                        warn!(error = %e, "resync after reconnect failed");
                    }
                }
                was_connected = status.is_connected();
            }
            else => break,
        }
    }

    resource.close().await;
    Ok(())
}

pub async fn post_comment(
    pb: &PocketBase,
    thread_id: &str,
    author_id: &str,
    content: &str,
) -> Result<()> {
    let values = CommentValues {
        thread: Some(thread_id.to_string()),
        author: Some(author_id.to_string()),
        content: Some(content.to_string()),
        ..Default::default()
    };
    let comment = pb
        .comments()
        .create(&values)
        .await
        .map_err(|e| miette::miette!("failed to post comment: {}", e))?;

    info!(id = %comment.system.id, thread = thread_id, "posted comment");
    println!("{}", comment.system.id);
    Ok(())
}

pub async fn delete_comment(pb: &PocketBase, comment_id: &str) -> Result<()> {
    pb.comments()
        .delete(comment_id)
        .await
        .map_err(|e| miette::miette!("failed to delete comment {}: {}", comment_id, e))?;
    info!(id = comment_id, "deleted comment");
    Ok(())
}

pub async fn resolve_thread(pb: &PocketBase, thread_id: &str) -> Result<()> {
    let values = ThreadValues {
        resolved: Some(true),
        ..Default::default()
    };
    let thread = pb
        .threads()
        .update(thread_id, &values)
        .await
        .map_err(|e| miette::miette!("failed to resolve thread {}: {}", thread_id, e))?;
    info!(id = thread_id, title = %thread.title, "resolved thread");
    Ok(())
}

pub async fn show_notebook(pb: &PocketBase, author_id: &str) -> Result<()> {
    let cache = QueryCache::new();
    let notebooks: CachedCollection<Notebook, _> = cache.collection(pb.notebooks());
    let filter = Filter::new("author = {:author}")
        .bind("author", author_id)
        .render();

    match notebooks
        .get_first_list_item_if(!author_id.is_empty(), &filter, &ListOptions::new())
        .await
    {
        Ok(Some(notebook)) => {
            println!("{}", notebook.content);
            Ok(())
        }
        Ok(None) => Err(miette::miette!("author id must not be empty")),
        Err(e) if e.is_not_found() => {
            println!("no notebook for author {}", author_id);
            Ok(())
        }
        Err(e) => Err(miette::miette!("failed to load notebook: {}", e)),
    }
}

fn format_thread(thread: &Thread) -> String {
    let marker = if thread.resolved { "x" } else { " " };
    let author = thread
        .expand
        .as_ref()
        .and_then(|e| e.author.as_ref())
        .and_then(|u| u.display_name())
        .unwrap_or(&thread.author);
    format!("[{}] {}  {} ({})", marker, thread.system.id, thread.title, author)
}

fn format_comment(comment: &Comment) -> String {
    let author = comment.author_name().unwrap_or(&comment.author);
    format!("{}  {}: {}", comment.system.id, author, comment.content)
}

fn print_comments(snapshot: &ListSnapshot<Comment>) {
    println!("--- {} comments ---", snapshot.total_items);
    for comment in &snapshot.items {
        println!("{}", format_comment(comment));
    }
}
