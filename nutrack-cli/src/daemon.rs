//! `run` mode: background scheduler plus line commands on stdin

use anyhow::Result;
use nutrack_sync::{ChannelBroadcaster, Entity, Scheduler};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Run the scheduler and accept commands on stdin, one per line:
/// `mutated <entity>`, `sync`, `sync-force`.
pub async fn run(scheduler: Arc<Scheduler>, channel: Arc<ChannelBroadcaster>, stdio: bool) -> Result<()> {
    scheduler.start();

    if !stdio {
        let mut events = channel.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                info!("Event: {}", event);
            }
        });
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
        }
    };
    command_loop(&scheduler, BufReader::new(tokio::io::stdin()), shutdown).await?;

    info!("Shutting down");
    scheduler.stop();
    Ok(())
}

/// Dispatch commands from `input` until `shutdown` resolves. Each command
/// runs in its own task so a slow transfer never delays shutdown. Closing
/// `input` stops reading but keeps the scheduler running.
async fn command_loop<R, S>(scheduler: &Arc<Scheduler>, input: R, shutdown: S) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut reading = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if reading => match line? {
                Some(line) => {
                    tokio::spawn(handle_command(scheduler.clone(), line));
                }
                None => reading = false,
            },
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}

async fn handle_command(scheduler: Arc<Scheduler>, line: String) {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (None, _) => {}
        (Some("mutated"), Some(entity)) => match entity.parse::<Entity>() {
            Ok(entity) => {
                if let Err(e) = scheduler.on_local_mutation(entity) {
                    warn!("Failed to record local change: {}", e);
                }
            }
            Err(e) => warn!("{}", e),
        },
        (Some("sync"), None) => scheduler.engine().sync_before_read().await,
        (Some("sync-force"), None) => {
            if let Err(e) = scheduler.engine().sync_if_due(true).await {
                warn!("Forced sync failed: {}", e);
            }
        }
        _ => warn!("Unknown command: {}", line.trim()),
    }
}
