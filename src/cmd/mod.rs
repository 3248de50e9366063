//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled            |
//! |------------|-----------------------------|
//! | `workflow` | `Workflow`                  |
//! | `lock`     | `Lock`                      |
//! | `events`   | `Events`                    |
//! | `run`      | `Run`, `Scan`               |
//! | `config`   | `Config`                    |
//!
//! `context` wires the store, lease coordinator and engine from resolved
//! configuration.

pub mod config;
pub mod context;
pub mod events;
pub mod lock;
pub mod run;
pub mod workflow;

pub use config::cmd_config;
pub use context::AppContext;
pub use events::cmd_events;
pub use lock::cmd_lock;
pub use run::{RunOptions, cmd_run, cmd_scan};
pub use workflow::cmd_workflow;

use anyhow::{Result, bail};

/// Split `OWNER/REPO`.
pub fn parse_repo(value: &str) -> Result<(String, String)> {
    match value.split_once('/') {
        Some((owner, repo))
            if !owner.trim().is_empty() && !repo.trim().is_empty() && !repo.contains('/') =>
        {
            Ok((owner.trim().to_string(), repo.trim().to_string()))
        }
        _ => bail!("Expected repository as OWNER/REPO, got '{}'", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo() {
        assert_eq!(
            parse_repo("acme/widgets").unwrap(),
            ("acme".to_string(), "widgets".to_string())
        );
        assert!(parse_repo("acme").is_err());
        assert!(parse_repo("/widgets").is_err());
        assert!(parse_repo("acme/widgets/extra").is_err());
    }
}
