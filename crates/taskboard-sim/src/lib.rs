//! taskboard-sim library.
//!
//! Runs an employee session and a manager session against one in-memory
//! backend through a seeded sequence of edits and network faults, then
//! checks that each session's task view matches what the server shows it.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskboard_core::clock::{Clock, ManualClock};
use taskboard_core::config::{RealtimeConfig, SyncConfig};
use taskboard_core::error::SyncError;
use taskboard_core::model::{
    AnyRecord, CollectionName, Priority, Profile, Record, RecordId, Role, Status, Task,
};
use taskboard_core::mutation::Optimism;
use taskboard_core::service::MemoryBackend;

use crate::oracle::{CheckPhase, Divergence, compare_views};
use crate::rng::SimRng;
use crate::session::SimulatedSession;

pub const EMPLOYEE: &str = "employee";
pub const MANAGER: &str = "manager";

const START_MILLIS: i64 = 1_717_200_000_000;
const READY_LIMIT: Duration = Duration::from_secs(5);
const CONVERGE_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Chance per round that every realtime connection drops.
    pub disconnect_percent: u8,
    /// Chance per round that the next data-service query fails.
    pub query_failure_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub rounds: u32,
    /// Tasks assigned to the employee before either session starts.
    pub initial_tasks: u32,
    /// Write through [`Optimism::Optimistic`] instead of waiting for the echo.
    pub optimistic: bool,
    /// Pause between rounds so realtime deliveries land.
    pub settle_ms: u64,
    pub fault: FaultConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            rounds: 40,
            initial_tasks: 6,
            optimistic: false,
            settle_ms: 5,
            fault: FaultConfig {
                disconnect_percent: 10,
                query_failure_percent: 5,
            },
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.fault.disconnect_percent > 100 || self.fault.query_failure_percent > 100 {
            bail!("fault percentages must be within 0..=100");
        }
        Ok(())
    }

    const fn optimism(&self) -> Optimism {
        if self.optimistic {
            Optimism::Optimistic
        } else {
            Optimism::AwaitEcho
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    ChangeStatus,
    ChangePriority,
    Rename,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Denied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Mutation {
        actor: String,
        action: Action,
        task_id: i64,
        outcome: Outcome,
    },
    Disconnect,
    QueryFault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u32,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    /// Whether the views were compared before any re-fetch. Skipped once a
    /// fault has been injected, since lost push events are only recovered
    /// by re-fetching.
    pub realtime_checked: bool,
    pub divergences: Vec<Divergence>,
}

impl SimulationResult {
    #[must_use]
    pub fn converged(&self) -> bool {
        self.divergences.is_empty()
    }

    #[must_use]
    pub fn count_outcomes(&self, wanted: fn(&Outcome) -> bool) -> usize {
        self.trace
            .iter()
            .filter(|e| matches!(&e.kind, TraceEventKind::Mutation { outcome, .. } if wanted(outcome)))
            .count()
    }

    #[must_use]
    pub fn faults(&self) -> usize {
        self.trace
            .iter()
            .filter(|e| matches!(e.kind, TraceEventKind::Disconnect | TraceEventKind::QueryFault))
            .count()
    }
}

pub struct Simulator {
    config: SimulationConfig,
    rng: SimRng,
    backend: Arc<MemoryBackend>,
    clock: Arc<ManualClock>,
    next_task_id: i64,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;

        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let backend = MemoryBackend::new();
        let now = timestamp(clock.now_millis());
        backend.seed(AnyRecord::Profiles(profile(EMPLOYEE, Role::Employee, now)));
        backend.seed(AnyRecord::Profiles(profile(MANAGER, Role::Manager, now)));

        let mut next_task_id = 1;
        for _ in 0..config.initial_tasks {
            backend.seed(new_task(next_task_id, EMPLOYEE, MANAGER, now).into_any());
            next_task_id += 1;
        }

        Ok(Self {
            rng: SimRng::new(config.seed),
            config,
            backend,
            clock,
            next_task_id,
        })
    }

    #[must_use]
    pub const fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn sync_config() -> SyncConfig {
        SyncConfig {
            realtime: RealtimeConfig {
                collections: vec![CollectionName::Tasks],
                reconnect_initial_ms: 5,
                reconnect_max_ms: 100,
            },
            ..SyncConfig::default()
        }
    }

    pub async fn run(&mut self) -> Result<SimulationResult> {
        let clock: Arc<dyn Clock> = self.clock.clone();
        let employee =
            SimulatedSession::start(&self.backend, EMPLOYEE, Self::sync_config(), Arc::clone(&clock))
                .await?;
        let manager =
            SimulatedSession::start(&self.backend, MANAGER, Self::sync_config(), clock).await?;
        employee.wait_ready(READY_LIMIT).await?;
        manager.wait_ready(READY_LIMIT).await?;
        let sessions = [employee, manager];

        let settle = Duration::from_millis(self.config.settle_ms);
        let mut trace = Vec::new();
        for round in 0..self.config.rounds {
            self.clock.advance_millis(1_000);
            self.inject_faults(round, &mut trace);

            let actor_index = usize::from(self.rng.chance(50));
            let kind = self.step(round, &sessions[actor_index]).await;
            tracing::debug!(round, ?kind, "round complete");
            trace.push(TraceEvent { round, kind });
            tokio::time::sleep(settle).await;
        }
        self.backend.fail_next_queries(0);

        let realtime_checked = !trace
            .iter()
            .any(|e| matches!(e.kind, TraceEventKind::Disconnect | TraceEventKind::QueryFault));
        let mut divergences = Vec::new();
        if realtime_checked {
            for session in &sessions {
                divergences.extend(self.check(session, CheckPhase::Realtime).await);
            }
        }
        for session in &sessions {
            session.wait_ready(READY_LIMIT).await?;
            session.refresh(READY_LIMIT).await?;
            divergences.extend(self.check(session, CheckPhase::Refetch).await);
        }

        let result = SimulationResult {
            seed: self.config.seed,
            trace,
            realtime_checked,
            divergences,
        };
        tracing::info!(
            seed = result.seed,
            rounds = self.config.rounds,
            faults = result.faults(),
            converged = result.converged(),
            "simulation finished"
        );
        Ok(result)
    }

    fn inject_faults(&mut self, round: u32, trace: &mut Vec<TraceEvent>) {
        if self.rng.chance(self.config.fault.disconnect_percent) {
            self.backend.disconnect_all("simulated network drop");
            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Disconnect,
            });
        }
        if self.rng.chance(self.config.fault.query_failure_percent) {
            self.backend.fail_next_queries(1);
            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::QueryFault,
            });
        }
    }

    async fn step(&mut self, round: u32, actor: &SimulatedSession) -> TraceEventKind {
        let mutator = actor.mutator(self.config.optimism());
        let now = timestamp(self.clock.now_millis());
        let visible = actor.expected_view(&self.backend);

        let roll = self.rng.below(100);
        let target = self.rng.pick(&visible).cloned();
        let (action, task_id, result) = match target {
            Some(target) if roll >= 20 => {
                let task_id = target.id;
                let previous = Some(target.clone().into_any());
                let mut edited = target;
                edited.updated_at = now;
                let action = match roll {
                    20..=49 => {
                        let options: Vec<Status> =
                            Status::ALL.into_iter().filter(|s| *s != edited.status).collect();
                        edited.status = self.rng.pick(&options).copied().unwrap_or(Status::Todo);
                        Action::ChangeStatus
                    }
                    50..=64 => {
                        let options = [Priority::Low, Priority::Medium, Priority::High];
                        edited.priority = self.rng.pick(&options).copied().unwrap_or_default();
                        Action::ChangePriority
                    }
                    65..=79 => {
                        edited.title = format!("Task {task_id} rev {round}");
                        Action::Rename
                    }
                    _ => Action::Delete,
                };
                let result = if action == Action::Delete {
                    mutator
                        .delete(CollectionName::Tasks, RecordId::Int(task_id), previous)
                        .await
                } else {
                    mutator.update(edited.into_any(), previous).await.map(|_| ())
                };
                (action, task_id, result)
            }
            _ => {
                let task_id = self.next_task_id;
                self.next_task_id += 1;
                let assignee = if actor.user_id() == MANAGER && self.rng.chance(50) {
                    MANAGER
                } else {
                    EMPLOYEE
                };
                let task = new_task(task_id, assignee, actor.user_id(), now);
                let result = mutator.insert(task.into_any()).await.map(|_| ());
                (Action::Create, task_id, result)
            }
        };

        let outcome = match result {
            Ok(()) => Outcome::Accepted,
            Err(SyncError::PermissionDenied(_)) => Outcome::Denied,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        TraceEventKind::Mutation {
            actor: actor.user_id().to_string(),
            action,
            task_id,
            outcome,
        }
    }

    async fn check(&self, session: &SimulatedSession, phase: CheckPhase) -> Vec<Divergence> {
        let expected = session.expected_view(&self.backend);
        if session.wait_for_view(&expected, CONVERGE_LIMIT).await {
            return Vec::new();
        }
        let found = compare_views(session.user_id(), phase, &expected, &session.view());
        for divergence in &found {
            tracing::warn!(%divergence, "view diverged from server");
        }
        found
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("next_task_id", &self.next_task_id)
            .finish_non_exhaustive()
    }
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn profile(id: &str, role: Role, now: DateTime<Utc>) -> Profile {
    Profile {
        id: id.to_string(),
        full_name: id.to_string(),
        email: format!("{id}@taskboard.test"),
        role,
        avatar_url: None,
        updated_at: now,
    }
}

fn new_task(id: i64, assignee: &str, creator: &str, now: DateTime<Utc>) -> Task {
    Task {
        id,
        title: format!("Task {id}"),
        description: None,
        user_id: assignee.to_string(),
        created_by: creator.to_string(),
        project_id: None,
        status: Status::Todo,
        priority: Priority::Medium,
        due_date: None,
        created_at: now,
        updated_at: now,
        attachments: vec![],
        time_logs: vec![],
        comments: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::{FaultConfig, Outcome, SimulationConfig, Simulator};

    fn quiet(seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            rounds: 24,
            fault: FaultConfig::default(),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn zero_rounds_rejected() {
        let config = SimulationConfig {
            rounds: 0,
            ..SimulationConfig::default()
        };
        assert!(Simulator::new(config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fault_free_run_converges_over_realtime() {
        let mut sim = Simulator::new(quiet(11)).expect("valid config");
        let result = sim.run().await.expect("run");
        assert!(result.realtime_checked);
        assert!(result.converged(), "{:?}", result.divergences);
        assert_eq!(result.trace.len(), 24);
        assert!(result.count_outcomes(|o| *o == Outcome::Accepted) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_writes_converge() {
        let config = SimulationConfig {
            optimistic: true,
            ..quiet(5)
        };
        let mut sim = Simulator::new(config).expect("valid config");
        let result = sim.run().await.expect("run");
        assert!(result.converged(), "{:?}", result.divergences);
    }

    #[tokio::test(start_paused = true)]
    async fn faulty_run_converges_after_refetch() {
        let config = SimulationConfig {
            seed: 3,
            rounds: 30,
            fault: FaultConfig {
                disconnect_percent: 30,
                query_failure_percent: 20,
            },
            ..SimulationConfig::default()
        };
        let mut sim = Simulator::new(config).expect("valid config");
        let result = sim.run().await.expect("run");
        assert!(result.faults() > 0);
        assert!(!result.realtime_checked);
        assert!(result.converged(), "{:?}", result.divergences);
    }
}
