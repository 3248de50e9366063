//! Driver loop and repository scan: `cowork run` and `cowork scan`.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use cowork::server::{self, AppState};
use cowork::workflow::Watchdog;

use super::{AppContext, parse_repo};

pub struct RunOptions {
    pub interval: Duration,
    pub listen: Option<SocketAddr>,
    pub once: bool,
}

pub async fn cmd_scan(ctx: &AppContext, repo: &str) -> Result<()> {
    let (owner, repo) = parse_repo(repo)?;
    let workflows = ctx.engine.scan_repository(&owner, &repo).await?;
    if workflows.is_empty() {
        println!("No open issues in {}/{}.", owner, repo);
        return Ok(());
    }
    for wf in &workflows {
        println!(
            "  {:>6}  {}/{}#{}  {}",
            wf.id, wf.owner, wf.repo, wf.issue_number, wf.state
        );
    }
    println!(
        "{} {} workflow(s) for {}/{}",
        style("Tracking").green().bold(),
        workflows.len(),
        owner,
        repo
    );
    Ok(())
}

/// One processing pass: pending events first, then every active workflow.
async fn run_pass(ctx: &AppContext) {
    if let Err(e) = ctx.store.reload() {
        warn!(error = %e, "Failed to reload workflow store; using cached state");
    }
    match ctx.engine.process_pending_events(&ctx.events).await {
        Ok(0) => {}
        Ok(n) => info!(processed = n, "Processed pending events"),
        Err(e) => warn!(error = %e, "Event processing failed"),
    }
    match ctx.engine.process_active().await {
        Ok(0) => {}
        Ok(n) => info!(advanced = n, "Advanced workflows"),
        Err(e) => warn!(error = %e, "Workflow pass failed"),
    }
}

pub async fn cmd_run(ctx: AppContext, options: RunOptions) -> Result<()> {
    println!("{}", style("cowork driver").bold().cyan());
    println!("  holder    {}", ctx.engine.holder_id());
    println!("  data dir  {}", ctx.config.data_dir.display());
    println!("  interval  {}s", options.interval.as_secs());

    let mut watchdog = Watchdog::new(ctx.locks.clone(), ctx.config.watchdog_interval);
    watchdog.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = match options.listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind to {}", addr))?;
            println!("  webhooks  http://{}/webhooks/github", listener.local_addr()?);
            let state = AppState::new(ctx.store.clone());
            let mut rx = shutdown_rx.clone();
            let shutdown = async move {
                let _ = rx.wait_for(|stop| *stop).await;
            };
            Some(tokio::spawn(server::serve(listener, state, shutdown)))
        }
        None => None,
    };

    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_pass(&ctx).await;
                if options.once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = server {
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "Webhook receiver failed"),
            Err(e) => warn!(error = %e, "Webhook receiver task panicked"),
            Ok(Ok(())) => {}
        }
    }
    watchdog.stop().await;
    info!("Driver stopped");
    Ok(())
}
