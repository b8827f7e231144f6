//! Revision units: one versioned change with paired forward and backward sets.

use super::operation::OperationSet;
use crate::migration::StagePhase;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Literal marking a revision with no parent.
pub const BASE_MARKER: &str = "none";

/// Direction a revision is applied in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
pub enum Direction {
    /// Apply the upgrade set.
    Up,
    /// Apply the downgrade set.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "upgrade"),
            Direction::Down => write!(f, "downgrade"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" | "upgrade" => Ok(Direction::Up),
            "down" | "downgrade" => Ok(Direction::Down),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParentsRepr {
    One(String),
    Many(Vec<String>),
}

fn deserialize_parents<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let parents: Vec<String> = match ParentsRepr::deserialize(deserializer)? {
        ParentsRepr::One(parent) => vec![parent],
        ParentsRepr::Many(parents) => parents,
    };
    let parents: Vec<String> = parents.into_iter().filter(|p| p != BASE_MARKER).collect();

    if parents.len() > 2 {
        return Err(D::Error::custom(format!(
            "a revision has at most two parents, got {}",
            parents.len()
        )));
    }
    Ok(parents)
}

/// One versioned, directional schema change.
///
/// Immutable once authored: the checksum recorded at apply time is compared
/// on later runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionUnit {
    /// Unique revision id.
    pub id: String,
    /// Parent ids: none for the base, two for a merge.
    #[serde(default, deserialize_with = "deserialize_parents")]
    pub parents: Vec<String>,
    /// Authoring time; orders otherwise unordered revisions.
    pub created_at: DateTime<Utc>,
    /// Human readable description.
    #[serde(default)]
    pub message: String,
    /// Staging protocol phase this revision implements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<StagePhase>,
    /// Table refactor this revision belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refactor: Option<String>,
    /// Forward operations.
    #[serde(default)]
    pub upgrade: OperationSet,
    /// Backward operations.
    #[serde(default)]
    pub downgrade: OperationSet,
}

impl RevisionUnit {
    /// Create a revision with empty operation sets.
    pub fn new(
        id: impl Into<String>,
        parents: impl IntoIterator<Item = impl Into<String>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            parents: parents.into_iter().map(Into::into).collect(),
            created_at,
            message: String::new(),
            phase: None,
            refactor: None,
            upgrade: OperationSet::default(),
            downgrade: OperationSet::default(),
        }
    }

    /// Set the description.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set the forward operations.
    pub fn with_upgrade(mut self, set: OperationSet) -> Self {
        self.upgrade = set;
        self
    }

    /// Set the backward operations.
    pub fn with_downgrade(mut self, set: OperationSet) -> Self {
        self.downgrade = set;
        self
    }

    /// Tag the revision as a staging protocol phase of `refactor`.
    pub fn with_phase(mut self, refactor: impl Into<String>, phase: StagePhase) -> Self {
        self.refactor = Some(refactor.into());
        self.phase = Some(phase);
        self
    }

    /// Whether this revision has no parent.
    pub fn is_base(&self) -> bool {
        self.parents.is_empty()
    }

    /// Whether this revision joins two branches.
    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }

    /// Operation set for a direction.
    pub fn operations(&self, direction: Direction) -> &OperationSet {
        match direction {
            Direction::Up => &self.upgrade,
            Direction::Down => &self.downgrade,
        }
    }

    /// Content checksum over id, parents and both operation sets.
    pub fn checksum(&self) -> String {
        let content = (&self.id, &self.parents, &self.upgrade, &self.downgrade);
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        hex::encode(blake3::hash(&bytes).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::Operation;

    fn at(ts: &str) -> DateTime<Utc> {
        ts.parse().unwrap()
    }

    #[test]
    fn test_parse_base_marker() {
        let text = r#"
id = "a1"
parents = "none"
created_at = "2024-03-01T10:00:00Z"
"#;
        let unit: RevisionUnit = toml::from_str(text).unwrap();
        assert!(unit.is_base());
        assert!(!unit.upgrade.is_one_way());
    }

    #[test]
    fn test_parse_merge() {
        let text = r#"
id = "c3"
parents = ["b2", "d4"]
created_at = "2024-03-03T10:00:00Z"
message = "merge enum unification branch"
"#;
        let unit: RevisionUnit = toml::from_str(text).unwrap();
        assert!(unit.is_merge());
        assert_eq!(unit.parents, vec!["b2".to_string(), "d4".to_string()]);
    }

    #[test]
    fn test_rejects_three_parents() {
        let text = r#"
id = "x"
parents = ["a", "b", "c"]
created_at = "2024-03-03T10:00:00Z"
"#;
        assert!(toml::from_str::<RevisionUnit>(text).is_err());
    }

    #[test]
    fn test_checksum_tracks_operations() {
        let unit = RevisionUnit::new("a1", Vec::<String>::new(), at("2024-03-01T10:00:00Z"));
        let same = unit.clone().with_message("message is not part of the checksum");
        assert_eq!(unit.checksum(), same.checksum());

        let edited = unit.clone().with_upgrade(OperationSet::reversible(vec![
            Operation::DropTable {
                table: "movements".to_string(),
            },
        ]));
        assert_ne!(unit.checksum(), edited.checksum());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("up".parse::<Direction>().unwrap(), Direction::Up);
        assert_eq!("downgrade".parse::<Direction>().unwrap(), Direction::Down);
        assert!("sideways".parse::<Direction>().is_err());
    }
}
