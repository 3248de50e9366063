//! Workflow commands: `cowork workflow create|list|show|delete|process|abort`.

use anyhow::{Result, bail};
use console::style;

use cowork::workflow::{CreateWorkflowRequest, SyncStrategy, Workflow, WorkflowState};

use super::super::WorkflowCommands;
use super::{AppContext, parse_repo};

pub async fn cmd_workflow(ctx: &AppContext, command: WorkflowCommands) -> Result<()> {
    match command {
        WorkflowCommands::Create {
            repo,
            issue,
            base_branch,
            sync_strategy,
            draft,
        } => {
            let (owner, repo) = parse_repo(&repo)?;
            let mut config = ctx.config.workflow_defaults();
            if let Some(strategy) = sync_strategy {
                config.sync_strategy = strategy.parse::<SyncStrategy>()?;
            }
            config.draft_pr |= draft;
            let base = base_branch.unwrap_or_else(|| ctx.config.toml.defaults.base_branch.clone());

            let existing = ctx.store.get_workflow_by_issue(&owner, &repo, issue)?;
            let wf = ctx.store.create_workflow(
                CreateWorkflowRequest::new(&owner, &repo, issue)
                    .with_base_branch(&base)
                    .with_config(config),
            )?;
            if existing.is_some() {
                println!(
                    "{} workflow {} already tracks {}",
                    style("Exists:").yellow(),
                    wf.id,
                    issue_ref(&wf)
                );
            } else {
                println!(
                    "{} workflow {} for {}",
                    style("Created").green().bold(),
                    wf.id,
                    issue_ref(&wf)
                );
            }
        }
        WorkflowCommands::List { state } => {
            let workflows = match state {
                Some(s) => {
                    let state: WorkflowState = s.parse().map_err(anyhow::Error::msg)?;
                    ctx.store.list_workflows_by_state(state)?
                }
                None => ctx.store.list_workflows()?,
            };
            if workflows.is_empty() {
                println!("No workflows.");
                return Ok(());
            }
            println!(
                "{}",
                style(format!(
                    "{:>6}  {:<16} {:<32} {:<6} {}",
                    "ID", "STATE", "ISSUE", "PR", "BRANCH"
                ))
                .bold()
            );
            for wf in &workflows {
                println!(
                    "{:>6}  {} {:<32} {:<6} {}",
                    wf.id,
                    state_style(wf.state, &format!("{:<16}", wf.state.as_str())),
                    issue_ref(wf),
                    wf.pr_number.map(|n| format!("#{}", n)).unwrap_or_else(|| "-".into()),
                    wf.branch_name.as_deref().unwrap_or("-"),
                );
            }
        }
        WorkflowCommands::Show { id } => {
            let wf = ctx.store.get_workflow(id)?;
            print_workflow(&wf);
            if let Some(lock) = ctx.locks.active_lock(id)? {
                println!(
                    "  {:<14} {} (pid {}) until {}",
                    "lease",
                    lock.holder_id,
                    lock.pid,
                    lock.expires_at.to_rfc3339()
                );
            }
        }
        WorkflowCommands::Delete { id } => {
            if ctx.locks.is_locked(id)? {
                bail!(
                    "Workflow {} is leased; release it first with 'cowork lock force-unlock {}'",
                    id,
                    id
                );
            }
            ctx.store.delete_workflow(id)?;
            println!("{} workflow {}", style("Deleted").green(), id);
        }
        WorkflowCommands::Process { id } => {
            let before = ctx.store.get_workflow(id)?.state;
            let wf = ctx.engine.process_workflow(id).await?;
            if wf.state == before {
                println!("Workflow {} stays {}", wf.id, state_style(wf.state, wf.state.as_str()));
            } else {
                println!(
                    "Workflow {}: {} -> {}",
                    wf.id,
                    before,
                    state_style(wf.state, wf.state.as_str())
                );
            }
        }
        WorkflowCommands::Abort { id, reason } => {
            let wf = ctx.engine.abort_workflow(id, &reason).await?;
            println!("{} workflow {} ({})", style("Aborted").red().bold(), wf.id, reason);
        }
    }
    Ok(())
}

fn issue_ref(wf: &Workflow) -> String {
    format!("{}/{}#{}", wf.owner, wf.repo, wf.issue_number)
}

fn state_style(state: WorkflowState, text: &str) -> console::StyledObject<String> {
    let styled = style(text.to_string());
    match state {
        WorkflowState::Merged => styled.green(),
        WorkflowState::Closed => styled.dim(),
        WorkflowState::Aborted => styled.red(),
        WorkflowState::Revising => styled.yellow(),
        _ => styled.cyan(),
    }
}

fn print_workflow(wf: &Workflow) {
    println!();
    println!("{}", style(format!("Workflow {}", wf.id)).bold().cyan());
    let row = |label: &str, value: String| println!("  {:<14} {}", label, value);
    let opt = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_else(|| "-".into());

    row("issue", issue_ref(wf));
    row("state", state_style(wf.state, wf.state.as_str()).to_string());
    row("base", wf.base_branch.clone());
    row("branch", wf.branch_name.clone().unwrap_or_else(|| "-".into()));
    row("pull request", opt(wf.pr_number));
    row("task", opt(wf.task_id));
    row("workspace", opt(wf.workspace_id));
    row("provider", wf.provider.clone());
    row(
        "config",
        format!(
            "sync={} draft={} retries={} timeout={}m",
            wf.config.sync_strategy,
            wf.config.draft_pr,
            wf.config.max_retries,
            wf.config.timeout_minutes
        ),
    );
    row("created", wf.created_at.to_rfc3339());
    row("updated", wf.updated_at.to_rfc3339());
    if let Some(started) = wf.started_at {
        row("started", started.to_rfc3339());
    }
    if let Some(ended) = wf.ended_at {
        row("ended", ended.to_rfc3339());
    }
    if wf.error_count > 0 {
        row("errors", wf.error_count.to_string());
    }
    if let Some(err) = &wf.last_error {
        row("last error", style(err).red().to_string());
    }
    for (key, value) in &wf.metadata {
        row(key.as_str(), value.clone());
    }
}
