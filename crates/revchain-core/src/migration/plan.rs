//! Migration plans.
//!
//! A plan is the resolved, validated list of revisions a run would apply,
//! with the static warnings a reviewer should see before executing it.

use super::error::MigrationError;
use super::graph::{RevisionGraph, Target};
use super::staging::StagePhase;
use super::state::SchemaState;
use crate::revision::{Direction, RevisionUnit};
use std::collections::{BTreeSet, HashMap};

/// A single revision in a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    /// Revision id.
    pub revision: String,
    /// Direction it will be applied in.
    pub direction: Direction,
    /// Revision description.
    pub message: String,
    /// Staging phase, if the revision is part of a refactor.
    pub phase: Option<StagePhase>,
    /// Refactor tag.
    pub refactor: Option<String>,
    /// Number of operations in the set that will run.
    pub operations: usize,
    /// The one-way reason when the set that will run is tagged one-way.
    pub one_way: Option<String>,
}

impl PlanStep {
    fn new(unit: &RevisionUnit, direction: Direction) -> Self {
        let set = unit.operations(direction);
        Self {
            revision: unit.id.clone(),
            direction,
            message: unit.message.clone(),
            phase: unit.phase,
            refactor: unit.refactor.clone(),
            operations: set.len(),
            one_way: set.reason().map(str::to_string),
        }
    }
}

/// An ordered list of revisions to apply in one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    /// Direction of the run.
    pub direction: Direction,
    /// Requested target.
    pub target: Target,
    /// Pointers before the run.
    pub from: SchemaState,
    /// Revisions in execution order.
    pub steps: Vec<PlanStep>,
    /// Static warnings about one-way steps.
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    /// Resolve and validate the path from `state` to `target`.
    pub fn build(
        graph: &RevisionGraph,
        state: &SchemaState,
        direction: Direction,
        target: &Target,
    ) -> Result<Self, MigrationError> {
        graph.validate_state(state)?;

        let path = match direction {
            Direction::Up => graph.upgrade_path(state, target)?,
            Direction::Down => graph.downgrade_path(state, target)?,
        };

        let mut steps = Vec::with_capacity(path.len());
        for id in &path {
            steps.push(PlanStep::new(graph.require(id)?, direction));
        }

        let warnings = steps
            .iter()
            .filter_map(|step| {
                step.one_way.as_ref().map(|reason| match direction {
                    Direction::Up => format!(
                        "upgrade of '{}' is destructive: {}",
                        step.revision, reason
                    ),
                    Direction::Down => format!(
                        "downgrade of '{}' is one-way and only best effort: {}",
                        step.revision, reason
                    ),
                })
            })
            .collect();

        let plan = Self {
            direction,
            target: target.clone(),
            from: state.clone(),
            steps,
            warnings,
        };
        plan.validate_phases(graph, &graph.applied(state)?)?;
        Ok(plan)
    }

    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of revisions in the plan.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Revision ids in execution order.
    pub fn revisions(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.revision.as_str())
    }

    /// Check staging phase ordering for every refactor the plan touches.
    ///
    /// Upgrading a phase requires every earlier phase of the same refactor
    /// to be applied or earlier in the plan, and Cleanup additionally
    /// requires a FixForeignKeys phase to exist. Downgrading a phase
    /// requires every later phase to be unapplied or earlier in the plan.
    pub fn validate_phases(
        &self,
        graph: &RevisionGraph,
        applied: &BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        let mut phases: HashMap<&str, Vec<(StagePhase, &str)>> = HashMap::new();
        for unit in graph.revisions() {
            if let (Some(refactor), Some(phase)) = (unit.refactor.as_deref(), unit.phase) {
                phases.entry(refactor).or_default().push((phase, unit.id.as_str()));
            }
        }

        let position: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.revision.as_str(), i))
            .collect();

        for (index, step) in self.steps.iter().enumerate() {
            let (Some(refactor), Some(phase)) = (step.refactor.as_deref(), step.phase) else {
                continue;
            };
            let siblings = phases.get(refactor).map(Vec::as_slice).unwrap_or(&[]);
            let earlier_in_plan = |id: &str| position.get(id).map(|p| *p < index).unwrap_or(false);

            match self.direction {
                Direction::Up => {
                    if phase == StagePhase::Cleanup
                        && !siblings
                            .iter()
                            .any(|(p, _)| *p == StagePhase::FixForeignKeys)
                    {
                        return Err(MigrationError::PhaseOrder {
                            refactor: refactor.to_string(),
                            message: format!(
                                "cleanup revision '{}' has no fix_foreign_keys phase before it",
                                step.revision
                            ),
                        });
                    }
                    for (other, id) in siblings {
                        if *other < phase && !applied.contains(*id) && !earlier_in_plan(id) {
                            return Err(MigrationError::PhaseOrder {
                                refactor: refactor.to_string(),
                                message: format!(
                                    "{} revision '{}' would run before {} revision '{}'",
                                    phase, step.revision, other, id
                                ),
                            });
                        }
                    }
                }
                Direction::Down => {
                    for (other, id) in siblings {
                        if *other > phase && applied.contains(*id) && !earlier_in_plan(id) {
                            return Err(MigrationError::PhaseOrder {
                                refactor: refactor.to_string(),
                                message: format!(
                                    "{} revision '{}' would be reverted while {} revision '{}' is applied",
                                    phase, step.revision, other, id
                                ),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::staging::StagedRefactor;
    use crate::schema::{ColumnDef, ColumnType, TableDef};
    use chrono::{DateTime, Utc};

    fn table() -> TableDef {
        TableDef::new("movements", "id").with_column(ColumnDef::required("id", ColumnType::Integer))
    }

    fn base() -> RevisionUnit {
        let at: DateTime<Utc> = "2024-05-01T08:00:00Z".parse().unwrap();
        RevisionUnit::new("base", Vec::<String>::new(), at)
    }

    fn refactor_units() -> Vec<RevisionUnit> {
        let start: DateTime<Utc> = "2024-05-01T09:00:00Z".parse().unwrap();
        StagedRefactor::new(table(), table()).revisions(Some("base"), start)
    }

    #[test]
    fn test_plan_warns_on_one_way_steps() {
        let mut units = refactor_units();
        units.push(base());
        let graph = RevisionGraph::new(units).unwrap();

        let up = MigrationPlan::build(&graph, &SchemaState::base(), Direction::Up, &Target::Head)
            .unwrap();
        assert_eq!(up.len(), 7);
        assert_eq!(up.warnings.len(), 1);
        assert!(up.warnings[0].contains("movements_cleanup"));

        let at_head = SchemaState::from_heads(["movements_cleanup".to_string()]);
        let down =
            MigrationPlan::build(&graph, &at_head, Direction::Down, &Target::Base).unwrap();
        assert_eq!(down.revisions().next(), Some("movements_cleanup"));
        assert_eq!(down.warnings.len(), 2);
    }

    #[test]
    fn test_cleanup_requires_fix_foreign_keys() {
        let units: Vec<RevisionUnit> = refactor_units()
            .into_iter()
            .filter(|u| u.phase != Some(StagePhase::FixForeignKeys))
            .map(|mut u| {
                if u.phase == Some(StagePhase::Cleanup) {
                    u.parents = vec!["movements_table_swap".to_string()];
                }
                u
            })
            .chain(std::iter::once(base()))
            .collect();
        let graph = RevisionGraph::new(units).unwrap();

        let err = MigrationPlan::build(&graph, &SchemaState::base(), Direction::Up, &Target::Head)
            .unwrap_err();
        assert!(matches!(err, MigrationError::PhaseOrder { .. }));
    }

    #[test]
    fn test_out_of_order_phases_rejected() {
        // Populate authored on a branch of its own, so the graph alone would
        // let it run before the staging table exists.
        let mut units = refactor_units();
        for unit in units.iter_mut() {
            if unit.phase == Some(StagePhase::Populate) {
                unit.parents = vec!["base".to_string()];
                unit.created_at = "2024-05-01T08:30:00Z".parse().unwrap();
            }
        }
        units.push(base());
        let graph = RevisionGraph::new(units).unwrap();

        let err = MigrationPlan::build(
            &graph,
            &SchemaState::base(),
            Direction::Up,
            &Target::Revision("movements_populate".to_string()),
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::PhaseOrder { .. }));
    }
}
