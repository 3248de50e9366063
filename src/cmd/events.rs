//! Event queue commands: `cowork events list|show|mark`.

use anyhow::Result;
use console::style;

use cowork::workflow::WorkflowEvent;

use super::super::EventsCommands;
use super::AppContext;

pub fn cmd_events(ctx: &AppContext, command: EventsCommands) -> Result<()> {
    match command {
        EventsCommands::List { all } => {
            let events = if all {
                ctx.events.all()?
            } else {
                ctx.events.pending()?
            };
            if events.is_empty() {
                println!("{}", if all { "No events." } else { "No pending events." });
                return Ok(());
            }
            for event in &events {
                let marker = if event.processed {
                    style("done").dim()
                } else {
                    style("pending").yellow()
                };
                println!(
                    "{}  {:<8} {:<20} {}/{}#{}  {}",
                    event.id,
                    marker,
                    summary(event),
                    event.owner,
                    event.repo,
                    event.issue_number,
                    event.timestamp.to_rfc3339()
                );
            }
        }
        EventsCommands::Show { id } => {
            let event = ctx.events.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        EventsCommands::Mark {
            id,
            workflow,
            error,
        } => {
            let event = ctx.events.mark_processed(&id, workflow, error)?;
            println!("{} event {}", style("Marked").green(), event.id);
        }
    }
    Ok(())
}

fn summary(event: &WorkflowEvent) -> String {
    match event.action() {
        Some(action) => format!("{}.{}", event.event_type, action),
        None => event.event_type.clone(),
    }
}
