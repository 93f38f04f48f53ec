//! Resolver - フィールド単位のマージ
//!
//! Fields changed on one side only take that side's value. Fields changed on
//! both sides go through the authority policy table. There is no record-level
//! "last writer wins".

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::domain::{Field, FieldValues, Side, Status, SyncError};

use super::detector::EntityState;

/// How a field changed on both sides is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    LocalWins,
    RemoteWins,
    /// Remote wins when it is closing the item, local wins otherwise.
    RemoteWinsIfClosed,
}

/// The default authority table. Title, labels, section and the rest of the
/// planning data belong to the local file; closing an issue on the tracker is
/// honoured.
pub const DEFAULT_RULES: &[(Field, Rule)] = &[
    (Field::Title, Rule::LocalWins),
    (Field::Status, Rule::RemoteWinsIfClosed),
    (Field::Labels, Rule::LocalWins),
    (Field::Section, Rule::LocalWins),
    (Field::Milestone, Rule::LocalWins),
    (Field::Type, Rule::LocalWins),
    (Field::Priority, Rule::LocalWins),
];

/// Field → rule. A field with no rule cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    rules: BTreeMap<Field, Rule>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::from_rules(DEFAULT_RULES.iter().copied())
    }
}

impl PolicyTable {
    pub fn from_rules(rules: impl IntoIterator<Item = (Field, Rule)>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    pub fn with_rule(mut self, field: Field, rule: Rule) -> Self {
        self.rules.insert(field, rule);
        self
    }

    pub fn rule(&self, field: Field) -> Option<Rule> {
        self.rules.get(&field).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldDecision {
    pub field: Field,
    pub winner: Side,
}

/// Merged values for one entity plus the conflicts that were decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub merged: FieldValues,
    pub decisions: Vec<FieldDecision>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    policy: PolicyTable,
}

impl Resolver {
    pub fn new(policy: PolicyTable) -> Self {
        Self { policy }
    }

    /// Merge one entity. Entities without a remote side merge to their local values.
    pub fn resolve(&self, entity: &EntityState) -> Result<Resolution, SyncError> {
        let Some(remote) = &entity.remote else {
            return Ok(Resolution {
                merged: entity.local.clone(),
                decisions: Vec::new(),
            });
        };
        self.merge(
            &entity.local,
            remote,
            &entity.change.local_changed,
            &entity.change.remote_changed,
        )
        .inspect(|resolution| {
            for decision in &resolution.decisions {
                debug!("{}: {} conflict won by {:?}", entity.id(), decision.field, decision.winner);
            }
        })
    }

    pub fn merge(
        &self,
        local: &FieldValues,
        remote: &FieldValues,
        local_changed: &BTreeSet<Field>,
        remote_changed: &BTreeSet<Field>,
    ) -> Result<Resolution, SyncError> {
        let mut merged = local.clone();
        let mut decisions = Vec::new();
        for field in Field::ALL {
            match (local_changed.contains(&field), remote_changed.contains(&field)) {
                (false, true) => merged.take(remote, field),
                (true, true) if local.differs(remote, field) => {
                    let rule = self
                        .policy
                        .rule(field)
                        .ok_or(SyncError::ConflictUnresolvable(field))?;
                    let winner = decide(rule, field, remote);
                    if winner == Side::Remote {
                        merged.take(remote, field);
                    }
                    decisions.push(FieldDecision { field, winner });
                }
                // Local-only change, convergent edit, or untouched: local already holds it.
                _ => {}
            }
        }
        Ok(Resolution { merged, decisions })
    }
}

fn decide(rule: Rule, field: Field, remote: &FieldValues) -> Side {
    match rule {
        Rule::LocalWins => Side::Local,
        Rule::RemoteWins => Side::Remote,
        Rule::RemoteWinsIfClosed => {
            if field == Field::Status && remote.status == Status::Closed {
                Side::Remote
            } else {
                Side::Local
            }
        }
    }
}
