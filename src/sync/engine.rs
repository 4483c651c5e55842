//! Synchronization Engine
//!
//! Runs one synchronization end to end: write gate and topology lock,
//! `Inactive -> Synchronizing`, snapshots, structural plan, data, sequences,
//! verification and `Synchronizing -> Active`. Any failure leaves the target
//! Inactive with its dropped constraints restored where possible.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use super::reconcile::{Reconciler, Side};
use super::{SyncReport, SyncStep, SyncStrategy, SynchronizationPlan};
use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::executor::{Connection, DriverSet, Value};
use crate::lock::{Locks, TopologyGuard};
use crate::metadata::{capture_snapshot, ForeignKeyConstraint, SchemaSnapshot, UniqueConstraint};
use crate::state::{Backend, BackendRegistry, BackendState, StateTracker};

/// Constraints dropped from the target for the data phase, in drop order
#[derive(Default)]
struct Dropped {
    foreign_keys: Vec<ForeignKeyConstraint>,
    unique_constraints: Vec<UniqueConstraint>,
}

impl Dropped {
    fn len(&self) -> usize {
        self.foreign_keys.len() + self.unique_constraints.len()
    }

    /// Recreate everything still dropped: unique constraints first, then
    /// foreign keys parents first. Recreated entries are removed, so a
    /// retry after a failure only touches what is left.
    async fn recreate(&mut self, conn: &mut dyn Connection, dialect: &dyn Dialect) -> Result<()> {
        while let Some(constraint) = self.unique_constraints.last() {
            conn.execute(&dialect.create_unique_constraint_sql(constraint), &[])
                .await?;
            self.unique_constraints.pop();
        }
        while let Some(key) = self.foreign_keys.last() {
            conn.execute(&dialect.create_foreign_key_sql(key), &[]).await?;
            self.foreign_keys.pop();
        }
        Ok(())
    }
}

/// Wrap a step failure, keeping an already attributed one
fn failure(step: SyncStep, backend: &str, cause: Error) -> Error {
    match cause {
        Error::Synchronization { .. } => cause,
        cause => Error::Synchronization {
            step,
            backend: backend.to_string(),
            cause: Box::new(cause),
        },
    }
}

/// Synchronizes inactive backends from active ones
pub struct SyncEngine {
    registry: Arc<BackendRegistry>,
    drivers: Arc<DriverSet>,
    locks: Arc<Locks>,
    write_gate: Arc<RwLock<()>>,
    tracker: Option<Arc<StateTracker>>,
    reconciler: Reconciler,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        drivers: Arc<DriverSet>,
        locks: Arc<Locks>,
        write_gate: Arc<RwLock<()>>,
        tracker: Option<Arc<StateTracker>>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            drivers,
            locks,
            write_gate,
            tracker,
            reconciler: Reconciler::new(batch_size),
        }
    }

    /// Capture a backend's schema
    pub async fn snapshot(&self, backend: &Backend) -> Result<SchemaSnapshot> {
        let driver = self.drivers.get(&backend.name)?;
        let mut conn = driver.connector.connect().await?;
        capture_snapshot(
            &backend.name,
            conn.as_mut(),
            driver.dialect.as_ref(),
            backend.schema.as_deref(),
        )
        .await
    }

    /// Structural plan that synchronizing `target` from `reference` would
    /// apply, without changing anything
    pub async fn plan(&self, target: &str, reference: &str) -> Result<SynchronizationPlan> {
        let target = self.registry.backend(target).await?;
        let reference = self.registry.backend(reference).await?;
        let target_snapshot = self.snapshot(&target).await?;
        let reference_snapshot = self.snapshot(&reference).await?;

        let differences = reference_snapshot.table_differences(&target_snapshot);
        if !differences.is_empty() {
            return Err(Error::Schema(differences.join("; ")));
        }
        Ok(SynchronizationPlan::compute(&reference_snapshot, &target_snapshot))
    }

    /// Synchronize `target` from the active backend `reference` and return
    /// it to the active set
    pub async fn synchronize(
        &self,
        target: &str,
        reference: &str,
        strategy: SyncStrategy,
    ) -> Result<SyncReport> {
        if target == reference {
            return Err(Error::State(format!(
                "cannot synchronize {} from itself",
                target
            )));
        }
        let target_backend = self.registry.backend(target).await?;
        let reference_backend = self.registry.backend(reference).await?;
        let started = Instant::now();
        tracing::info!("Synchronizing {} from {} ({})", target, reference, strategy);

        // No local write may land between the data copy and activation
        let _gate = self.write_gate.write().await;
        let guard = self
            .locks
            .acquire_topology()
            .await
            .map_err(|e| failure(SyncStep::Lock, target, e))?;

        if let Err(e) = self.enter(target, reference, &guard).await {
            release(guard).await;
            return Err(failure(SyncStep::Transition, target, e));
        }

        let mut dropped = Dropped::default();
        let result = match self
            .run(&target_backend, &reference_backend, strategy, &mut dropped)
            .await
        {
            Ok(mut report) => match self.registry.complete_synchronization(target, &guard).await {
                Ok(()) => {
                    report.duration_ms = started.elapsed().as_millis() as u64;
                    Ok(report)
                }
                Err(e) => Err(failure(SyncStep::Activate, target, e)),
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => tracing::info!(
                "Backend {} synchronized from {} in {} ms",
                target,
                reference,
                report.duration_ms
            ),
            Err(e) => {
                tracing::error!("{}", e);
                self.restore(&target_backend, &mut dropped).await;
                if let Err(abort) = self.registry.abort_synchronization(target, &guard).await {
                    tracing::error!("Failed to return {} to inactive: {}", target, abort);
                }
            }
        }

        self.record(target, strategy, &result).await;
        release(guard).await;
        result
    }

    /// Check the reference and move the target to Synchronizing
    async fn enter(&self, target: &str, reference: &str, guard: &TopologyGuard) -> Result<()> {
        let state = self.registry.state(reference).await?;
        if state != BackendState::Active {
            return Err(Error::State(format!(
                "reference backend {} is {}",
                reference, state
            )));
        }
        self.registry.begin_synchronization(target, guard).await
    }

    async fn run(
        &self,
        target: &Backend,
        reference: &Backend,
        strategy: SyncStrategy,
        dropped: &mut Dropped,
    ) -> Result<SyncReport> {
        let name = target.name.as_str();
        let at = |step: SyncStep| move |e: Error| failure(step, name, e);

        let target_driver = self.drivers.get(&target.name).map_err(at(SyncStep::Snapshot))?;
        let reference_driver = self
            .drivers
            .get(&reference.name)
            .map_err(at(SyncStep::Snapshot))?;
        let target_dialect = target_driver.dialect.as_ref();
        let mut target_conn = target_driver
            .connector
            .connect()
            .await
            .map_err(at(SyncStep::Snapshot))?;
        let mut reference_conn = reference_driver
            .connector
            .connect()
            .await
            .map_err(at(SyncStep::Snapshot))?;

        let reference_snapshot = capture_snapshot(
            &reference.name,
            reference_conn.as_mut(),
            reference_driver.dialect.as_ref(),
            reference.schema.as_deref(),
        )
        .await
        .map_err(at(SyncStep::Snapshot))?;
        let target_snapshot = capture_snapshot(
            &target.name,
            target_conn.as_mut(),
            target_dialect,
            target.schema.as_deref(),
        )
        .await
        .map_err(at(SyncStep::Snapshot))?;

        let differences = reference_snapshot.table_differences(&target_snapshot);
        if !differences.is_empty() {
            return Err(at(SyncStep::Compare)(Error::Schema(differences.join("; "))));
        }
        let plan = SynchronizationPlan::compute(&reference_snapshot, &target_snapshot);
        tracing::info!("Plan for {}: {} structural changes", name, plan.len());
        for step in &plan.steps {
            tracing::debug!("  {}", step);
        }

        let mut report = SyncReport {
            backend: target.name.clone(),
            reference: reference.name.clone(),
            strategy,
            structural_changes: plan.len(),
            tables: Vec::new(),
            sequences_reset: 0,
            duration_ms: 0,
        };

        if strategy == SyncStrategy::Passive {
            if !plan.is_empty() {
                let steps: Vec<String> = plan.steps.iter().map(|s| s.to_string()).collect();
                return Err(at(SyncStep::Verify)(Error::Schema(format!(
                    "structure differs: {}",
                    steps.join(", ")
                ))));
            }
            let mut reference_side = Side {
                conn: reference_conn.as_mut(),
                dialect: reference_driver.dialect.as_ref(),
            };
            let mut target_side = Side {
                conn: target_conn.as_mut(),
                dialect: target_dialect,
            };
            for table in reference_snapshot.tables.values() {
                let same = self
                    .reconciler
                    .verify(table, &mut reference_side, &mut target_side)
                    .await
                    .map_err(at(SyncStep::Verify))?;
                if !same {
                    return Err(at(SyncStep::Verify)(Error::State(format!(
                        "table {} differs from {}",
                        table.name, reference.name
                    ))));
                }
            }
            return Ok(report);
        }

        tracing::info!("Dropping constraints on {}", name);
        for step in plan.before_data() {
            target_conn
                .execute(&step.sql(target_dialect), &[])
                .await
                .map_err(at(SyncStep::DropConstraints))?;
        }

        let mut shared_keys: Vec<&ForeignKeyConstraint> = target_snapshot
            .foreign_keys
            .iter()
            .filter(|k| reference_snapshot.foreign_keys.contains(k))
            .collect();
        shared_keys.sort_by_key(|k| std::cmp::Reverse(target_snapshot.dependency_rank(&k.table)));
        for key in shared_keys {
            target_conn
                .execute(&target_dialect.drop_foreign_key_sql(key), &[])
                .await
                .map_err(at(SyncStep::DropConstraints))?;
            dropped.foreign_keys.push(key.clone());
        }
        if strategy == SyncStrategy::Diff {
            // Updates in key order may pass through transient duplicates
            for constraint in target_snapshot
                .unique_constraints
                .iter()
                .filter(|c| reference_snapshot.unique_constraints.contains(c))
            {
                target_conn
                    .execute(&target_dialect.drop_unique_constraint_sql(constraint), &[])
                    .await
                    .map_err(at(SyncStep::DropConstraints))?;
                dropped.unique_constraints.push(constraint.clone());
            }
        }

        {
            let mut reference_side = Side {
                conn: reference_conn.as_mut(),
                dialect: reference_driver.dialect.as_ref(),
            };
            let mut target_side = Side {
                conn: target_conn.as_mut(),
                dialect: target_dialect,
            };
            for table_name in reference_snapshot.dependency_order() {
                let Some(table) = reference_snapshot.table(&table_name) else {
                    continue;
                };
                let table_report = match strategy {
                    SyncStrategy::Diff => {
                        self.reconciler
                            .diff(table, &mut reference_side, &mut target_side)
                            .await
                    }
                    _ => {
                        self.reconciler
                            .full_copy(table, &mut reference_side, &mut target_side)
                            .await
                    }
                }
                .map_err(at(SyncStep::Data))?;
                tracing::info!(
                    "Table {} on {}: {} inserted, {} updated, {} deleted",
                    table_report.table,
                    name,
                    table_report.inserted,
                    table_report.updated,
                    table_report.deleted
                );
                report.tables.push(table_report);
            }
        }

        tracing::info!("Restoring constraints on {}", name);
        dropped
            .recreate(target_conn.as_mut(), target_dialect)
            .await
            .map_err(at(SyncStep::RestoreConstraints))?;
        for step in plan.after_data() {
            target_conn
                .execute(&step.sql(target_dialect), &[])
                .await
                .map_err(at(SyncStep::RestoreConstraints))?;
        }

        report.sequences_reset = self
            .align_sequences(&reference_snapshot, target_conn.as_mut(), target_dialect)
            .await
            .map_err(at(SyncStep::Sequences))?;

        let after = capture_snapshot(name, target_conn.as_mut(), target_dialect, target.schema.as_deref())
            .await
            .map_err(at(SyncStep::Verify))?;
        if !after.schema_equals(&reference_snapshot) {
            return Err(at(SyncStep::Verify)(Error::Schema(format!(
                "schema of {} still differs from {}",
                name, reference.name
            ))));
        }

        Ok(report)
    }

    /// Restart every target sequence past the highest value any active
    /// backend hands out. Each active backend draws once, so they stay
    /// aligned with each other.
    async fn align_sequences(
        &self,
        reference: &SchemaSnapshot,
        target_conn: &mut dyn Connection,
        target_dialect: &dyn Dialect,
    ) -> Result<usize> {
        if reference.sequences.is_empty() {
            return Ok(0);
        }

        let mut active = Vec::new();
        for backend in self.registry.active_backends().await {
            let driver = self.drivers.get(&backend.name)?;
            let conn = driver.connector.connect().await?;
            active.push((backend, conn, driver.dialect.clone()));
        }

        for sequence in &reference.sequences {
            let lock = self.locks.acquire_sequence(&sequence.name.name).await?;
            let mut highest: Option<i64> = None;
            for (backend, conn, dialect) in active.iter_mut() {
                let rows = conn
                    .query(&dialect.sequence_next_value_sql(&sequence.name), &[])
                    .await?;
                let value = rows.scalar().and_then(Value::as_i64).ok_or_else(|| {
                    Error::Schema(format!(
                        "sequence {} returned no value on {}",
                        sequence.name, backend.name
                    ))
                })?;
                highest = highest.max(Some(value));
            }

            if let Some(value) = highest {
                let next = value + sequence.increment;
                target_conn
                    .execute(&target_dialect.alter_sequence_sql(&sequence.name, next), &[])
                    .await?;
                tracing::debug!("Sequence {} restarts at {}", sequence.name, next);
            }
            if let Err(e) = lock.release().await {
                tracing::warn!("Failed to release sequence lock: {}", e);
            }
        }
        Ok(reference.sequences.len())
    }

    /// Best-effort recreation of constraints dropped before a failure
    async fn restore(&self, target: &Backend, dropped: &mut Dropped) {
        if dropped.len() == 0 {
            return;
        }
        let restored = async {
            let driver = self.drivers.get(&target.name)?;
            let mut conn = driver.connector.connect().await?;
            dropped.recreate(conn.as_mut(), driver.dialect.as_ref()).await
        };
        if let Err(e) = restored.await {
            tracing::error!(
                "Could not restore {} constraints on {}: {}",
                dropped.len(),
                target.name,
                e
            );
        }
    }

    async fn record(&self, backend: &str, strategy: SyncStrategy, result: &Result<SyncReport>) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let detail = result.as_ref().err().map(|e| e.to_string());
        let outcome = match &detail {
            Some(detail) => Err(detail.as_str()),
            None => Ok(()),
        };
        if let Err(e) = tracker.record_sync(backend, strategy.as_str(), outcome).await {
            tracing::warn!("Failed to record synchronization of {}: {}", backend, e);
        }
    }
}

async fn release(guard: TopologyGuard) {
    if let Err(e) = guard.release().await {
        tracing::warn!("Failed to release topology lock: {}", e);
    }
}
