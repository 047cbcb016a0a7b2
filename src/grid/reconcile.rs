//! Periodic reconciliation: snapshot the venue, diff against the ledger, act

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::interval_at;

use super::boundary::BoundaryMonitor;
use super::config::BoundaryAction;
use super::engine::{EngineInner, GridCore};
use super::errors::{GridError, GridResult};
use super::gateway::ExchangeGateway;
use super::risk::PositionRisk;
use super::types::{EngineState, RemoteSnapshot};

/// What a reconciliation pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PassOutcome {
    /// Actions were executed; `failed` of them did not go through
    Reconciled {
        placed: usize,
        cancelled: usize,
        failed: usize,
    },
    /// The range was recentered; a fresh pass seeds the new epoch
    Adjusted,
    /// Boundary breach or stop-loss/take-profit halted the engine
    Halted,
    /// Engine not running
    Skipped,
}

impl<G: ExchangeGateway + 'static> EngineInner<G> {
    pub(crate) async fn run_reconcile_loop(self: Arc<Self>) {
        let period = self.settings.reconcile_interval();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        let mut halting = self.halting.subscribe();

        info!("Reconcile loop started, interval {:?}", period);

        loop {
            if self.is_halting() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = halting.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if self.is_halting() {
                break;
            }

            match self.run_pass().await {
                Ok(PassOutcome::Halted) => break,
                Ok(outcome) => debug!("Reconcile pass: {:?}", outcome),
                Err(e) => warn!("Reconcile pass skipped: {}", e),
            }
        }

        info!("Reconcile loop exited");
    }

    /// One pass, plus a follow-up pass when the range was recentered
    pub(crate) async fn run_pass(&self) -> GridResult<PassOutcome> {
        match self.reconcile_pass().await? {
            PassOutcome::Adjusted => self.reconcile_pass().await,
            outcome => Ok(outcome),
        }
    }

    async fn reconcile_pass(&self) -> GridResult<PassOutcome> {
        if self.is_halting() {
            return Ok(PassOutcome::Skipped);
        }

        let symbol = self.core.lock().await.symbol();

        // Network I/O stays outside the lock
        let snapshot = match self.fetch_snapshot(&symbol).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let mut core = self.core.lock().await;
                core.consecutive_failures += 1;
                let since = *core.stale_since.get_or_insert_with(Utc::now);
                warn!(
                    "Snapshot fetch failed ({} in a row, stale since {}): {}",
                    core.consecutive_failures, since, e
                );
                self.publish(&core).await;
                return Err(e);
            }
        };

        let mut core = self.core.lock().await;
        if core.state != EngineState::Running {
            debug!("Skipping reconcile in state {:?}", core.state);
            return Ok(PassOutcome::Skipped);
        }

        core.position = snapshot.position;
        core.last_price = Some(snapshot.price);
        core.consecutive_failures = 0;
        core.stale_since = None;

        let outcome = self.evaluate_and_act(&mut core, &snapshot).await;
        self.publish(&core).await;
        Ok(outcome)
    }

    async fn evaluate_and_act(&self, core: &mut GridCore, snapshot: &RemoteSnapshot) -> PassOutcome {
        let config = core.ledger.config().clone();

        if let Some(breach) = BoundaryMonitor::evaluate(snapshot.price, &config) {
            warn!(
                "Boundary breach on {}: price {} beyond {} ({:?}), action {:?}",
                config.symbol, breach.price, breach.limit, breach.direction, config.boundary_action
            );

            match config.boundary_action {
                BoundaryAction::EmergencyClose => {
                    self.halt_locked(core, breach.halt_reason(), true).await;
                    return PassOutcome::Halted;
                }
                BoundaryAction::HaltOnly => {
                    self.halt_locked(core, breach.halt_reason(), false).await;
                    return PassOutcome::Halted;
                }
                BoundaryAction::AutoAdjust => {
                    let target = BoundaryMonitor::recenter(&config, snapshot.price);
                    match self.adjust_locked(core, target).await {
                        Ok(()) => return PassOutcome::Adjusted,
                        Err(e) if e.is_transient() || matches!(e, GridError::RetriesExhausted { .. }) => {
                            warn!("Auto-adjust deferred to next pass: {}", e);
                            return PassOutcome::Skipped;
                        }
                        Err(e) => {
                            error!("Auto-adjust impossible, halting: {}", e);
                            self.halt_locked(core, breach.halt_reason(), false).await;
                            return PassOutcome::Halted;
                        }
                    }
                }
            }
        }

        if let Some(reason) = self
            .risk
            .evaluate_exit(&snapshot.position, snapshot.price, &config)
        {
            warn!("Exit threshold hit on {}: {:?}", config.symbol, reason);
            self.halt_locked(core, reason, true).await;
            return PassOutcome::Halted;
        }

        match self.risk.position_risk(&snapshot.position, &config) {
            PositionRisk::Safe => {}
            PositionRisk::NearLimit => warn!(
                "Position {} near max_position {}",
                snapshot.position.size, config.max_position
            ),
            PositionRisk::AtLimit => warn!(
                "Position {} at max_position {}, opening orders withheld",
                snapshot.position.size, config.max_position
            ),
        }

        let actions = core.ledger.reconcile(snapshot);
        let total = actions.len();
        let placed = actions.iter().filter(|a| a.is_place()).count();
        let cancelled = total - placed;

        let mut failed = 0;
        for action in actions {
            if self.execute_action(core, action).await.is_err() {
                failed += 1;
            }
        }

        if failed > 0 {
            warn!("{}; retrying next pass", GridError::PartialActionFailure { failed, total });
        }

        core.last_reconcile_time = Some(Utc::now());

        PassOutcome::Reconciled {
            placed,
            cancelled,
            failed,
        }
    }

    async fn fetch_snapshot(&self, symbol: &str) -> GridResult<RemoteSnapshot> {
        let taken_at = Instant::now();
        let policy = &self.policy;
        let gateway = &self.gateway;

        let (open_orders, position, price) = tokio::try_join!(
            policy.with_retry("get_open_orders", || gateway.get_open_orders(symbol)),
            policy.with_retry("get_position", || gateway.get_position(symbol)),
            policy.with_retry("get_current_price", || gateway.get_current_price(symbol)),
        )?;

        Ok(RemoteSnapshot {
            price,
            open_orders,
            position,
            taken_at,
        })
    }
}
