//! Structural synchronization plan

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::dialect::Dialect;
use crate::metadata::{ForeignKeyConstraint, SchemaSnapshot, SequenceProperties, UniqueConstraint};

/// One structural change to the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanStep {
    DropForeignKey(ForeignKeyConstraint),
    DropUniqueConstraint(UniqueConstraint),
    DropSequence(SequenceProperties),
    CreateSequence(SequenceProperties),
    CreateUniqueConstraint(UniqueConstraint),
    CreateForeignKey(ForeignKeyConstraint),
}

impl PlanStep {
    /// Whether the step runs before row data is reconciled
    pub fn before_data(&self) -> bool {
        matches!(
            self,
            PlanStep::DropForeignKey(_)
                | PlanStep::DropUniqueConstraint(_)
                | PlanStep::DropSequence(_)
                | PlanStep::CreateSequence(_)
        )
    }

    /// SQL applying the step on a backend speaking `dialect`
    pub fn sql(&self, dialect: &dyn Dialect) -> String {
        match self {
            PlanStep::DropForeignKey(key) => dialect.drop_foreign_key_sql(key),
            PlanStep::DropUniqueConstraint(constraint) => {
                dialect.drop_unique_constraint_sql(constraint)
            }
            PlanStep::DropSequence(sequence) => dialect.drop_sequence_sql(&sequence.name),
            // Value is reset once data is in place
            PlanStep::CreateSequence(sequence) => dialect.create_sequence_sql(sequence, 1),
            PlanStep::CreateUniqueConstraint(constraint) => {
                dialect.create_unique_constraint_sql(constraint)
            }
            PlanStep::CreateForeignKey(key) => dialect.create_foreign_key_sql(key),
        }
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStep::DropForeignKey(key) => write!(f, "drop foreign key {} on {}", key.name, key.table),
            PlanStep::DropUniqueConstraint(c) => write!(f, "drop unique {} on {}", c.name, c.table),
            PlanStep::DropSequence(s) => write!(f, "drop sequence {}", s.name),
            PlanStep::CreateSequence(s) => write!(f, "create sequence {}", s.name),
            PlanStep::CreateUniqueConstraint(c) => {
                write!(f, "create unique {} on {}", c.name, c.table)
            }
            PlanStep::CreateForeignKey(key) => {
                write!(f, "create foreign key {} on {}", key.name, key.table)
            }
        }
    }
}

/// Structural differences between a reference and a target snapshot, as
/// the ordered steps that remove them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationPlan {
    pub steps: Vec<PlanStep>,
}

impl SynchronizationPlan {
    /// Compute the steps turning `target`'s constraints and sequences into
    /// `reference`'s.
    ///
    /// Target-only objects are dropped first, foreign keys in reverse
    /// dependency order. Reference-only foreign keys are created last, in
    /// dependency order.
    pub fn compute(reference: &SchemaSnapshot, target: &SchemaSnapshot) -> Self {
        let mut steps = Vec::new();

        let reference_keys: HashSet<&ForeignKeyConstraint> = reference.foreign_keys.iter().collect();
        let target_keys: HashSet<&ForeignKeyConstraint> = target.foreign_keys.iter().collect();
        let reference_unique: HashSet<&UniqueConstraint> =
            reference.unique_constraints.iter().collect();
        let target_unique: HashSet<&UniqueConstraint> = target.unique_constraints.iter().collect();
        let reference_sequences: HashSet<&SequenceProperties> = reference.sequences.iter().collect();
        let target_sequences: HashSet<&SequenceProperties> = target.sequences.iter().collect();

        let mut obsolete_keys: Vec<&ForeignKeyConstraint> = target
            .foreign_keys
            .iter()
            .filter(|k| !reference_keys.contains(k))
            .collect();
        obsolete_keys.sort_by_key(|k| std::cmp::Reverse(target.dependency_rank(&k.table)));
        steps.extend(obsolete_keys.into_iter().cloned().map(PlanStep::DropForeignKey));

        steps.extend(
            target
                .unique_constraints
                .iter()
                .filter(|c| !reference_unique.contains(c))
                .cloned()
                .map(PlanStep::DropUniqueConstraint),
        );
        steps.extend(
            target
                .sequences
                .iter()
                .filter(|s| !reference_sequences.contains(s))
                .cloned()
                .map(PlanStep::DropSequence),
        );
        steps.extend(
            reference
                .sequences
                .iter()
                .filter(|s| !target_sequences.contains(s))
                .cloned()
                .map(PlanStep::CreateSequence),
        );
        steps.extend(
            reference
                .unique_constraints
                .iter()
                .filter(|c| !target_unique.contains(c))
                .cloned()
                .map(PlanStep::CreateUniqueConstraint),
        );

        let mut missing_keys: Vec<&ForeignKeyConstraint> = reference
            .foreign_keys
            .iter()
            .filter(|k| !target_keys.contains(k))
            .collect();
        missing_keys.sort_by_key(|k| reference.dependency_rank(&k.table));
        steps.extend(missing_keys.into_iter().cloned().map(PlanStep::CreateForeignKey));

        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Steps to apply before row data is reconciled
    pub fn before_data(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.before_data())
    }

    /// Steps to apply once row data is in place
    pub fn after_data(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| !s.before_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{self, DialectKind};
    use crate::metadata::tests::{foreign_key, snapshot, table};
    use crate::metadata::QualifiedName;

    fn sequence(name: &str, increment: i64) -> SequenceProperties {
        SequenceProperties {
            name: QualifiedName::new(name),
            increment,
        }
    }

    fn unique(name: &str, table: &str, columns: &[&str]) -> UniqueConstraint {
        UniqueConstraint {
            name: name.to_string(),
            table: QualifiedName::new(table),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn schema() -> SchemaSnapshot {
        let mut s = snapshot(
            "a",
            vec![
                table("customer", &["id", "email"], &["id"]),
                table("orders", &["id", "customer_id"], &["id"]),
            ],
            vec![foreign_key("fk_orders_customer", "orders", "customer")],
        );
        s.unique_constraints = vec![unique("uq_email", "customer", &["email"])];
        s.sequences = vec![sequence("order_seq", 1)];
        s
    }

    #[test]
    fn test_equal_snapshots_give_empty_plan() {
        let mut other = schema();
        other.backend = "b".to_string();
        // Reordered collections are still equal
        other.sequences.reverse();
        let plan = SynchronizationPlan::compute(&schema(), &other);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_drops_extras_and_creates_missing() {
        let reference = schema();
        let mut target = schema();
        target.backend = "b".to_string();
        target.foreign_keys.clear();
        target.unique_constraints = vec![unique("uq_stale", "customer", &["email"])];
        target.sequences = vec![sequence("order_seq", 5), sequence("legacy_seq", 1)];

        let plan = SynchronizationPlan::compute(&reference, &target);
        let rendered: Vec<String> = plan.steps.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "drop unique uq_stale on customer",
                "drop sequence order_seq",
                "drop sequence legacy_seq",
                "create sequence order_seq",
                "create unique uq_email on customer",
                "create foreign key fk_orders_customer on orders",
            ]
        );
        assert_eq!(plan.before_data().count(), 4);
        assert_eq!(plan.after_data().count(), 2);
    }

    #[test]
    fn test_obsolete_keys_dropped_children_first() {
        let reference = snapshot(
            "a",
            vec![
                table("a", &["id"], &["id"]),
                table("b", &["id", "a_id"], &["id"]),
                table("c", &["id", "b_id"], &["id"]),
            ],
            vec![],
        );
        let mut target = reference.clone();
        target.backend = "b".to_string();
        target.foreign_keys = vec![foreign_key("fk_b_a", "b", "a"), foreign_key("fk_c_b", "c", "b")];

        let plan = SynchronizationPlan::compute(&reference, &target);
        let names: Vec<&str> = plan
            .steps
            .iter()
            .map(|s| match s {
                PlanStep::DropForeignKey(k) => k.name.as_str(),
                other => panic!("unexpected {other}"),
            })
            .collect();
        assert_eq!(names, vec!["fk_c_b", "fk_b_a"]);
    }

    #[test]
    fn test_step_sql() {
        let standard = dialect::for_kind(DialectKind::Standard);
        let step = PlanStep::CreateSequence(sequence("order_seq", 2));
        assert_eq!(
            step.sql(standard.as_ref()),
            "CREATE SEQUENCE order_seq START WITH 1 INCREMENT BY 2"
        );
    }
}
