//! Lease commands: `cowork lock status|unlock|force-unlock`.

use anyhow::Result;
use chrono::Utc;
use console::style;

use cowork::workflow::WorkflowLock;

use super::super::LockCommands;
use super::AppContext;

pub fn cmd_lock(ctx: &AppContext, command: LockCommands) -> Result<()> {
    match command {
        LockCommands::Status { id: Some(id) } => {
            ctx.store.get_workflow(id)?;
            match ctx.locks.get_lock(id)? {
                Some(lock) => print_lock(&lock),
                None => println!("Workflow {} is not locked.", id),
            }
        }
        LockCommands::Status { id: None } => {
            let locks = ctx.store.list_lock_records()?;
            if locks.is_empty() {
                println!("No leases held.");
            }
            for lock in &locks {
                print_lock(lock);
            }
        }
        LockCommands::Unlock { id, holder } => {
            let holder = holder.unwrap_or_else(|| ctx.config.holder_id.clone());
            ctx.locks.unlock(id, &holder)?;
            println!("{} lease on workflow {}", style("Released").green(), id);
        }
        LockCommands::ForceUnlock { id } => {
            if ctx.locks.force_unlock(id)? {
                println!("{} lease on workflow {}", style("Force-released").yellow(), id);
            } else {
                println!("Workflow {} was not locked.", id);
            }
        }
    }
    Ok(())
}

fn print_lock(lock: &WorkflowLock) {
    let status = if lock.is_valid_at(Utc::now()) {
        style("active").green()
    } else {
        style("expired").red()
    };
    println!(
        "workflow {:<6} {:<8} holder={} pid={} acquired={} expires={}",
        lock.workflow_id,
        status,
        lock.holder_id,
        lock.pid,
        lock.acquired_at.to_rfc3339(),
        lock.expires_at.to_rfc3339()
    );
}
