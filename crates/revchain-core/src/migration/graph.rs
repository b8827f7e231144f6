//! Revision graph resolution.
//!
//! Revisions form a DAG through their parent pointers. A single global
//! topological order is computed once with Kahn's algorithm, breaking ties
//! by creation time and then id, so that sibling revisions (and the phases
//! of a staged refactor) always run in authoring order. Upgrade and
//! downgrade paths are filtered views of that order.

use super::error::MigrationError;
use super::state::SchemaState;
use crate::revision::RevisionUnit;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Where a run should leave the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The unique revision with no children.
    Head,
    /// Every revision with no children.
    Heads,
    /// Nothing applied.
    Base,
    /// A specific revision.
    Revision(String),
}

impl FromStr for Target {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "head" => Target::Head,
            "heads" => Target::Heads,
            "base" => Target::Base,
            id => Target::Revision(id.to_string()),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Head => write!(f, "head"),
            Target::Heads => write!(f, "heads"),
            Target::Base => write!(f, "base"),
            Target::Revision(id) => write!(f, "{}", id),
        }
    }
}

/// A validated, topologically ordered set of revisions.
#[derive(Debug, Clone)]
pub struct RevisionGraph {
    units: HashMap<String, RevisionUnit>,
    children: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl RevisionGraph {
    /// Build and validate a graph.
    ///
    /// Fails on duplicate ids, parents that do not exist, and cycles.
    pub fn new(units: Vec<RevisionUnit>) -> Result<Self, MigrationError> {
        let mut by_id: HashMap<String, RevisionUnit> = HashMap::with_capacity(units.len());
        for unit in units {
            if by_id.contains_key(&unit.id) {
                return Err(MigrationError::DuplicateRevision(unit.id));
            }
            by_id.insert(unit.id.clone(), unit);
        }

        let mut children: HashMap<String, Vec<String>> =
            by_id.keys().map(|id| (id.clone(), Vec::new())).collect();
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(by_id.len());
        for unit in by_id.values() {
            for parent in &unit.parents {
                match children.get_mut(parent) {
                    Some(list) => list.push(unit.id.clone()),
                    None => {
                        return Err(MigrationError::MissingParent {
                            revision: unit.id.clone(),
                            parent: parent.clone(),
                        })
                    }
                }
            }
            in_degree.insert(unit.id.as_str(), unit.parents.len());
        }

        let key = |unit: &RevisionUnit| -> Reverse<(DateTime<Utc>, String)> {
            Reverse((unit.created_at, unit.id.clone()))
        };

        let mut ready: BinaryHeap<Reverse<(DateTime<Utc>, String)>> = by_id
            .values()
            .filter(|unit| unit.parents.is_empty())
            .map(key)
            .collect();
        let mut order = Vec::with_capacity(by_id.len());

        while let Some(Reverse((_, id))) = ready.pop() {
            for child in children.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(unit) = by_id.get(child) {
                            ready.push(key(unit));
                        }
                    }
                }
            }
            order.push(id);
        }

        if order.len() < by_id.len() {
            let placed: BTreeSet<&String> = order.iter().collect();
            let mut revisions: Vec<String> = by_id
                .keys()
                .filter(|id| !placed.contains(id))
                .cloned()
                .collect();
            revisions.sort();
            return Err(MigrationError::Cycle { revisions });
        }

        for list in children.values_mut() {
            list.sort();
        }

        Ok(Self {
            units: by_id,
            children,
            order,
        })
    }

    /// Number of revisions.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no revisions.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Look up a revision.
    pub fn get(&self, id: &str) -> Option<&RevisionUnit> {
        self.units.get(id)
    }

    /// Look up a revision that must exist.
    pub fn require(&self, id: &str) -> Result<&RevisionUnit, MigrationError> {
        self.get(id)
            .ok_or_else(|| MigrationError::UnknownRevision(id.to_string()))
    }

    /// Revision ids in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Revisions in execution order.
    pub fn revisions(&self) -> impl Iterator<Item = &RevisionUnit> {
        self.order.iter().filter_map(|id| self.units.get(id))
    }

    /// Direct children of a revision.
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Revisions with no children, in execution order.
    pub fn heads(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.children(id).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Revisions with no parents, in execution order.
    pub fn bases(&self) -> Vec<&str> {
        self.revisions()
            .filter(|unit| unit.is_base())
            .map(|unit| unit.id.as_str())
            .collect()
    }

    /// The given revisions and every revision they descend from.
    pub fn ancestors<'a, I>(&self, ids: I) -> Result<BTreeSet<String>, MigrationError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = ids.into_iter().map(str::to_string).collect();
        while let Some(id) = stack.pop() {
            if seen.contains(&id) {
                continue;
            }
            let unit = self.require(&id)?;
            stack.extend(unit.parents.iter().cloned());
            seen.insert(id);
        }
        Ok(seen)
    }

    /// Revision ids a target stands for.
    pub fn resolve(&self, target: &Target) -> Result<Vec<String>, MigrationError> {
        match target {
            Target::Base => Ok(Vec::new()),
            Target::Heads => Ok(self.heads().into_iter().map(str::to_string).collect()),
            Target::Head => {
                let heads = self.heads();
                match heads.as_slice() {
                    [] => Ok(Vec::new()),
                    [head] => Ok(vec![head.to_string()]),
                    _ => Err(MigrationError::AmbiguousHead {
                        heads: heads.into_iter().map(str::to_string).collect(),
                    }),
                }
            }
            Target::Revision(id) => Ok(vec![self.require(id)?.id.clone()]),
        }
    }

    /// Every applied revision implied by the state's pointers.
    pub fn applied(&self, state: &SchemaState) -> Result<BTreeSet<String>, MigrationError> {
        self.ancestors(state.heads().iter().map(String::as_str))
            .map_err(|e| match e {
                MigrationError::UnknownRevision(id) => MigrationError::StateCorrupted {
                    message: format!("applied revision '{}' is not in the revision set", id),
                },
                other => other,
            })
    }

    /// Check that the state's pointers are known and independent.
    pub fn validate_state(&self, state: &SchemaState) -> Result<(), MigrationError> {
        let heads = state.heads();
        for head in heads {
            let below = self.applied(&SchemaState::from_heads([head.clone()]))?;
            if let Some(other) = heads.iter().find(|h| *h != head && below.contains(*h)) {
                return Err(MigrationError::StateCorrupted {
                    message: format!(
                        "pointer '{}' is an ancestor of pointer '{}'",
                        other, head
                    ),
                });
            }
        }
        Ok(())
    }

    /// Revisions to apply, in order, to bring `state` up to `target`.
    pub fn upgrade_path(
        &self,
        state: &SchemaState,
        target: &Target,
    ) -> Result<Vec<String>, MigrationError> {
        let targets = self.resolve(target)?;
        let wanted = self.ancestors(targets.iter().map(String::as_str))?;
        let applied = self.applied(state)?;

        Ok(self
            .order
            .iter()
            .filter(|id| wanted.contains(*id) && !applied.contains(*id))
            .cloned()
            .collect())
    }

    /// Revisions to revert, in order, to bring `state` down to `target`.
    ///
    /// Reverting below a merge reverts both of its branches.
    pub fn downgrade_path(
        &self,
        state: &SchemaState,
        target: &Target,
    ) -> Result<Vec<String>, MigrationError> {
        let applied = self.applied(state)?;
        let targets = self.resolve(target)?;
        if let Target::Revision(id) = target {
            if !applied.contains(id) {
                return Err(MigrationError::TargetNotApplied(id.clone()));
            }
        }
        let kept = self.ancestors(targets.iter().map(String::as_str))?;

        Ok(self
            .order
            .iter()
            .rev()
            .filter(|id| applied.contains(*id) && !kept.contains(*id))
            .cloned()
            .collect())
    }

    /// Revisions by id, for stable listings.
    pub fn by_id(&self) -> BTreeMap<&str, &RevisionUnit> {
        self.units.iter().map(|(id, unit)| (id.as_str(), unit)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, parents: &[&str], minute: u32) -> RevisionUnit {
        let at = format!("2024-03-01T10:{:02}:00Z", minute);
        RevisionUnit::new(id, parents.iter().copied(), at.parse().unwrap())
    }

    fn merge_graph() -> RevisionGraph {
        RevisionGraph::new(vec![
            unit("c", &["b", "d"], 3),
            unit("a", &[], 0),
            unit("d", &["a"], 2),
            unit("b", &["a"], 1),
        ])
        .unwrap()
    }

    #[test]
    fn test_order_follows_creation_time() {
        let graph = merge_graph();
        assert_eq!(graph.order(), &["a", "b", "d", "c"]);
        assert_eq!(graph.heads(), vec!["c"]);
        assert_eq!(graph.bases(), vec!["a"]);
    }

    #[test]
    fn test_tie_break_overrides_id_order() {
        let graph = RevisionGraph::new(vec![
            unit("a", &[], 0),
            unit("zz_first", &["a"], 1),
            unit("aa_second", &["a"], 2),
        ])
        .unwrap();
        assert_eq!(graph.order(), &["a", "zz_first", "aa_second"]);
    }

    #[test]
    fn test_cycle_detected() {
        let err = RevisionGraph::new(vec![
            unit("a", &[], 0),
            unit("b", &["a", "c"], 1),
            unit("c", &["b"], 2),
        ])
        .unwrap_err();
        match err {
            MigrationError::Cycle { revisions } => assert_eq!(revisions, vec!["b", "c"]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_missing_parent_and_duplicate() {
        assert!(matches!(
            RevisionGraph::new(vec![unit("b", &["a"], 1)]),
            Err(MigrationError::MissingParent { .. })
        ));
        assert!(matches!(
            RevisionGraph::new(vec![unit("a", &[], 0), unit("a", &[], 1)]),
            Err(MigrationError::DuplicateRevision(_))
        ));
    }

    #[test]
    fn test_ambiguous_head() {
        let graph = RevisionGraph::new(vec![
            unit("a", &[], 0),
            unit("b", &["a"], 1),
            unit("d", &["a"], 2),
        ])
        .unwrap();
        assert!(matches!(
            graph.upgrade_path(&SchemaState::default(), &Target::Head),
            Err(MigrationError::AmbiguousHead { .. })
        ));
        assert_eq!(
            graph
                .upgrade_path(&SchemaState::default(), &Target::Heads)
                .unwrap(),
            vec!["a", "b", "d"]
        );
    }

    #[test]
    fn test_merge_paths() {
        let graph = merge_graph();
        let base = SchemaState::default();
        assert_eq!(
            graph.upgrade_path(&base, &Target::Head).unwrap(),
            vec!["a", "b", "d", "c"]
        );

        let from_b = SchemaState::from_heads(["b".to_string()]);
        assert_eq!(
            graph.upgrade_path(&from_b, &Target::Head).unwrap(),
            vec!["d", "c"]
        );

        let at_head = SchemaState::from_heads(["c".to_string()]);
        assert!(graph.upgrade_path(&at_head, &Target::Head).unwrap().is_empty());
        assert_eq!(
            graph
                .downgrade_path(&at_head, &Target::Revision("a".to_string()))
                .unwrap(),
            vec!["c", "d", "b"]
        );
        assert_eq!(
            graph.downgrade_path(&at_head, &Target::Base).unwrap(),
            vec!["c", "d", "b", "a"]
        );
    }

    #[test]
    fn test_downgrade_to_unapplied_target() {
        let graph = merge_graph();
        let state = SchemaState::from_heads(["b".to_string()]);
        assert!(matches!(
            graph.downgrade_path(&state, &Target::Revision("d".to_string())),
            Err(MigrationError::TargetNotApplied(_))
        ));
    }

    #[test]
    fn test_validate_state() {
        let graph = merge_graph();
        assert!(graph
            .validate_state(&SchemaState::from_heads(["b".to_string(), "d".to_string()]))
            .is_ok());
        assert!(matches!(
            graph.validate_state(&SchemaState::from_heads(["a".to_string(), "b".to_string()])),
            Err(MigrationError::StateCorrupted { .. })
        ));
        assert!(matches!(
            graph.validate_state(&SchemaState::from_heads(["gone".to_string()])),
            Err(MigrationError::StateCorrupted { .. })
        ));
    }

    #[test]
    fn test_target_parse() {
        assert_eq!("head".parse::<Target>().unwrap(), Target::Head);
        assert_eq!("base".parse::<Target>().unwrap(), Target::Base);
        assert_eq!(
            "a1b2".parse::<Target>().unwrap(),
            Target::Revision("a1b2".to_string())
        );
    }
}
