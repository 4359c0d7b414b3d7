//! Tick scheduler
//!
//! Drives the periodic work of a client:
//!
//! - **Accrual** (every second by default): credits completed windows for
//!   every attached session and evaluates rules
//! - **Reconcile** (30s): push, sweep and pull per session
//! - **Aggregate** (5 min): community milestones and competition finalization
//!
//! Each tick kind has its own interval. A failed tick is reported on the
//! event channel and the loop carries on.

use crate::engine::EconomyEngine;
use crate::session::Session;
use chrono::{DateTime, Utc};
use orebit_core::{RuleId, UserId};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Kind of periodic work
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tick {
    Accrual,
    Reconcile,
    Aggregate,
}

/// Events emitted by the scheduler
#[derive(Clone, Debug, PartialEq)]
pub enum SchedulerEvent {
    /// Windows credited for one user
    Accrued {
        user: UserId,
        windows: usize,
        credited: u64,
        rules_applied: Vec<RuleId>,
    },
    Reconciled {
        user: UserId,
        pushed: usize,
        queued: usize,
    },
    /// Community and competition pass finished
    Aggregated {
        completed: Vec<String>,
        distributed: Vec<String>,
        competitions_finalized: usize,
    },
    /// Retries exhausted for one user; the UI shows "sync delayed"
    SyncDelayed { user: UserId },
    TickFailed { tick: Tick, error: String },
}

/// Scheduler statistics
#[derive(Clone, Debug, Default)]
pub struct SchedulerStats {
    pub accrual_ticks: u64,
    pub reconcile_ticks: u64,
    pub aggregate_ticks: u64,
    pub failures: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    engine: Arc<EconomyEngine>,
    sessions: RwLock<Vec<Arc<Session>>>,
    stats: Arc<RwLock<SchedulerStats>>,
    event_tx: broadcast::Sender<SchedulerEvent>,

    /// Whether this client also runs the aggregate tick
    aggregate: bool,
}

impl Scheduler {
    pub fn new(engine: Arc<EconomyEngine>) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            engine,
            sessions: RwLock::new(Vec::new()),
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
            event_tx,
            aggregate: true,
        }
    }

    /// Disable the aggregate tick (e.g. clients that only mine)
    pub fn without_aggregation(mut self) -> Self {
        self.aggregate = false;
        self
    }

    pub fn attach(&self, session: Arc<Session>) {
        self.sessions.write().push(session);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.read().clone()
    }

    fn emit(&self, event: SchedulerEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn fail(&self, tick: Tick, error: String) {
        warn!(?tick, %error, "Tick failed");
        self.stats.write().failures += 1;
        self.emit(SchedulerEvent::TickFailed { tick, error });
    }

    /// Run one tick of `kind` now
    pub async fn tick(&self, kind: Tick) {
        let now = self.engine.now();
        let sessions: Vec<Arc<Session>> = self.sessions.read().clone();
        {
            let mut stats = self.stats.write();
            match kind {
                Tick::Accrual => stats.accrual_ticks += 1,
                Tick::Reconcile => stats.reconcile_ticks += 1,
                Tick::Aggregate => stats.aggregate_ticks += 1,
            }
            stats.last_tick_at = Some(now);
        }

        match kind {
            Tick::Accrual => {
                for session in sessions {
                    match session.accrue(now).await {
                        Ok(report) => {
                            if !report.windows.is_empty() {
                                self.emit(SchedulerEvent::Accrued {
                                    user: session.user().clone(),
                                    windows: report.windows.len(),
                                    credited: report.credited,
                                    rules_applied: report.rules_applied,
                                });
                            }
                            if report.sync_delayed {
                                self.emit(SchedulerEvent::SyncDelayed {
                                    user: session.user().clone(),
                                });
                            }
                        }
                        Err(e) => self.fail(kind, e.to_string()),
                    }
                }
            }
            Tick::Reconcile => {
                for session in sessions {
                    match session.reconcile(now).await {
                        Ok(report) if report.sync_delayed => {
                            self.emit(SchedulerEvent::SyncDelayed {
                                user: session.user().clone(),
                            });
                        }
                        Ok(report) => self.emit(SchedulerEvent::Reconciled {
                            user: session.user().clone(),
                            pushed: report.pushed,
                            queued: report.queued,
                        }),
                        Err(e) => self.fail(kind, e.to_string()),
                    }
                }
            }
            Tick::Aggregate => match self.engine.run_aggregation(now).await {
                Ok(run) => self.emit(SchedulerEvent::Aggregated {
                    completed: run.community.completed,
                    distributed: run.community.distributed,
                    competitions_finalized: run
                        .competitions
                        .iter()
                        .filter(|r| r.pending == 0)
                        .count(),
                }),
                Err(e) => self.fail(kind, e.to_string()),
            },
        }
        debug!(?kind, "Tick finished");
    }

    /// Run until `shutdown_rx` fires
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let schedule = &self.engine.config().schedule;
        info!(
            accrual_ms = schedule.accrual_tick_ms,
            reconcile_secs = schedule.reconcile_interval_secs,
            aggregate_secs = schedule.aggregate_interval_secs,
            aggregate = self.aggregate,
            "Starting scheduler"
        );

        let mut accrual = tokio::time::interval(schedule.accrual_tick());
        let mut reconcile = tokio::time::interval(schedule.reconcile_interval());
        let mut aggregate = tokio::time::interval(schedule.aggregate_interval());
        for interval in [&mut accrual, &mut reconcile, &mut aggregate] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = accrual.tick() => self.tick(Tick::Accrual).await,
                _ = reconcile.tick() => self.tick(Tick::Reconcile).await,
                _ = aggregate.tick(), if self.aggregate => self.tick(Tick::Aggregate).await,
            }
        }
    }
}
