//! Subcommand handling.

use crate::formatter::Formatter;
use crate::Command;
use chrono::{DateTime, Utc};
use revchain_core::migration::{MigrationPlan, Migrator, RevisionGraph, SchemaState, Target};
use revchain_core::revision::{self, sql, Direction, RevisionUnit};
use revchain_core::schema::EmbeddedDatabase;
use revchain_core::ProjectConfig;
use std::error::Error;

type CommandResult = Result<String, Box<dyn Error>>;

/// Execute a subcommand and return its formatted output.
pub fn execute(config: &ProjectConfig, command: Command, formatter: &dyn Formatter) -> CommandResult {
    match command {
        Command::Upgrade { target } => {
            let mut migrator = open_migrator(config)?;
            let report = migrator.upgrade(&target)?;
            Ok(formatter.format_run(&report))
        }

        Command::Downgrade { target } => {
            let mut migrator = open_migrator(config)?;
            let report = migrator.downgrade(&target)?;
            Ok(formatter.format_run(&report))
        }

        Command::Plan {
            direction,
            target,
            sql,
        } => {
            let migrator = open_migrator(config)?;
            let plan = migrator.plan(direction, &target)?;
            if sql {
                let statements = render_plan(migrator.graph(), &plan)?;
                Ok(formatter.format_plan(&plan, Some(&statements)))
            } else {
                Ok(formatter.format_plan(&plan, None))
            }
        }

        Command::Status => {
            let migrator = open_migrator(config)?;
            Ok(formatter.format_status(&migrator.status()?))
        }

        Command::History => {
            let migrator = open_migrator(config)?;
            Ok(formatter.format_history(&migrator.history()?))
        }

        Command::Heads => {
            let graph = load_graph(config)?;
            let heads: Vec<String> = graph.heads().into_iter().map(str::to_string).collect();
            Ok(formatter.format_revisions("Heads", &heads))
        }

        Command::Check => check(config, formatter),

        Command::New { message } => new_revision(config, &message, formatter),

        Command::Repair => {
            let mut migrator = open_migrator(config)?;
            Ok(formatter.format_repair(&migrator.repair()?))
        }

        Command::Unlock => {
            let migrator = open_migrator(config)?;
            let message = match migrator.unlock()? {
                Some(lock) => format!("Released lock held by {} (pid {})", lock.owner, lock.pid),
                None => "Lock was not held".to_string(),
            };
            Ok(formatter.format_message(&message))
        }
    }
}

/// Lock owner recorded for runs started from this machine.
fn owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("revchain:{}", user)
}

fn load_units(config: &ProjectConfig) -> Result<Vec<RevisionUnit>, revision::LoadError> {
    if !config.revisions_dir.exists() {
        tracing::debug!(dir = %config.revisions_dir.display(), "revisions directory missing");
        return Ok(Vec::new());
    }
    revision::load_dir(&config.revisions_dir)
}

fn load_graph(config: &ProjectConfig) -> Result<RevisionGraph, Box<dyn Error>> {
    Ok(RevisionGraph::new(load_units(config)?)?)
}

fn open_migrator(config: &ProjectConfig) -> Result<Migrator<EmbeddedDatabase>, Box<dyn Error>> {
    let units = load_units(config)?;
    let db = sled::open(&config.data_path)?;
    let database = EmbeddedDatabase::open(&db)?;
    let migrator = Migrator::open(units, database, &db, config.migration.clone())?;
    Ok(migrator.with_owner(owner()))
}

fn render_plan(graph: &RevisionGraph, plan: &MigrationPlan) -> Result<Vec<Vec<String>>, Box<dyn Error>> {
    let mut rendered = Vec::with_capacity(plan.len());
    for step in &plan.steps {
        let unit = graph.require(&step.revision)?;
        rendered.push(sql::render_set(unit.operations(step.direction)));
    }
    Ok(rendered)
}

/// Validate the graph and every refactor's phase ordering from base.
fn check(config: &ProjectConfig, formatter: &dyn Formatter) -> CommandResult {
    let graph = load_graph(config)?;
    if graph.is_empty() {
        return Ok(formatter.format_message("No revisions"));
    }

    let plan = MigrationPlan::build(&graph, &SchemaState::base(), Direction::Up, &Target::Heads)?;
    let heads = graph.heads();
    let mut message = format!(
        "{} revision(s) OK, base: {}, head(s): {}",
        graph.len(),
        graph.bases().join(", "),
        heads.join(", ")
    );
    if heads.len() > 1 {
        message.push_str("\nmultiple heads: 'upgrade head' will refuse until a merge revision joins them");
    }
    for warning in &plan.warnings {
        message.push_str(&format!("\nwarning: {}", warning));
    }
    Ok(formatter.format_message(&message))
}

/// Write an empty revision parented on the current heads.
fn new_revision(config: &ProjectConfig, message: &str, formatter: &dyn Formatter) -> CommandResult {
    let graph = load_graph(config)?;
    let parents: Vec<String> = graph.heads().into_iter().map(str::to_string).collect();

    let now = Utc::now();
    let id = next_revision_id(&graph, now)?;
    let unit = RevisionUnit::new(id, parents, now).with_message(message);
    let path = revision::write_revision(&config.revisions_dir, &unit)?;

    tracing::info!(revision = %unit.id, parents = ?unit.parents, "created revision");
    Ok(formatter.format_message(&format!("Created {}", path.display())))
}

/// Timestamp id for a revision created at `now`.
fn next_revision_id(graph: &RevisionGraph, now: DateTime<Utc>) -> Result<String, Box<dyn Error>> {
    let id = now.format("%Y%m%d%H%M%S").to_string();
    if let Some(existing) = graph.get(&id) {
        return Err(format!(
            "revision '{}' ({}) already exists; retry in a second",
            id, existing.message
        )
        .into());
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TableFormatter;

    fn project(dir: &std::path::Path) -> ProjectConfig {
        ProjectConfig::default()
            .with_data_path(dir.join("state.db"))
            .with_revisions_dir(dir.join("revisions"))
    }

    #[test]
    fn test_new_chains_on_head() {
        let dir = tempfile::tempdir().unwrap();
        let config = project(dir.path());

        execute(&config, Command::New { message: "create programs".to_string() }, &TableFormatter)
            .unwrap();
        let graph = load_graph(&config).unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.revisions().all(|u| u.is_base()));

        let output = execute(&config, Command::Check, &TableFormatter).unwrap();
        assert!(output.contains("1 revision(s) OK"));
    }

    #[test]
    fn test_new_refuses_taken_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = project(dir.path());
        let now: DateTime<Utc> = "2024-06-03T08:00:00Z".parse().unwrap();

        let graph = load_graph(&config).unwrap();
        let id = next_revision_id(&graph, now).unwrap();
        assert_eq!(id, "20240603080000");
        let unit = RevisionUnit::new(id, Vec::<String>::new(), now).with_message("create programs");
        revision::write_revision(&config.revisions_dir, &unit).unwrap();

        let graph = load_graph(&config).unwrap();
        let err = next_revision_id(&graph, now).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(next_revision_id(&graph, now + chrono::Duration::seconds(1)).is_ok());
    }

    #[test]
    fn test_empty_project() {
        let dir = tempfile::tempdir().unwrap();
        let config = project(dir.path());

        let output = execute(&config, Command::Upgrade { target: Target::Heads }, &TableFormatter)
            .unwrap();
        assert!(output.starts_with("Already at"));
        let output = execute(&config, Command::Unlock, &TableFormatter).unwrap();
        assert_eq!(output, "Lock was not held");
    }
}
