//! Engine handle: lifecycle, the engine-wide lock and the published status
//!
//! All ledger and config mutation happens under `EngineInner::core`. The
//! reconcile loop, the fill listener, range adjustment and stop each take it
//! for their whole critical section. [`Engine::status`] reads a snapshot that
//! is republished after every critical section, so it never waits on the lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::config::{EngineSettings, GridConfig};
use super::errors::{GridError, GridResult};
use super::gateway::{CallPolicy, ExchangeGateway};
use super::ledger::OrderLedger;
use super::model::GridLadder;
use super::reconcile::PassOutcome;
use super::risk::RiskGuard;
use super::types::{
    Action, EngineState, EngineStatus, HaltReason, OrderRequest, PositionState,
};

/// Mutable engine state guarded by the engine-wide lock
pub(crate) struct GridCore {
    pub(crate) ledger: OrderLedger,
    pub(crate) state: EngineState,
    pub(crate) position: PositionState,
    pub(crate) last_price: Option<f64>,
    pub(crate) last_reconcile_time: Option<DateTime<Utc>>,
    pub(crate) stale_since: Option<DateTime<Utc>>,
    pub(crate) consecutive_failures: u32,
    pub(crate) halt_reason: Option<HaltReason>,
}

impl GridCore {
    fn new(ledger: OrderLedger, position: PositionState, price: f64) -> Self {
        Self {
            ledger,
            state: EngineState::Starting,
            position,
            last_price: Some(price),
            last_reconcile_time: None,
            stale_since: None,
            consecutive_failures: 0,
            halt_reason: None,
        }
    }

    pub(crate) fn transition(&mut self, next: EngineState) -> GridResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(GridError::InvalidState {
                current_state: format!("{:?} (requested {:?})", self.state, next),
            });
        }
        info!("Engine state: {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    pub(crate) fn require_running(&self) -> GridResult<()> {
        if self.state != EngineState::Running {
            return Err(GridError::InvalidState {
                current_state: format!("{:?}", self.state),
            });
        }
        Ok(())
    }

    pub(crate) fn symbol(&self) -> String {
        self.ledger.config().symbol.clone()
    }

    fn status(&self, run_id: &str) -> EngineStatus {
        EngineStatus {
            run_id: run_id.to_string(),
            epoch_id: self.ledger.epoch_id(),
            state: self.state,
            config: self.ledger.config().clone(),
            current_levels: self.ledger.level_views(),
            position: self.position,
            last_price: self.last_price,
            last_reconcile_time: self.last_reconcile_time,
            stale_since: self.stale_since,
            consecutive_failures: self.consecutive_failures,
            open_orders: self.ledger.open_order_count(),
            halt_reason: self.halt_reason.clone(),
        }
    }
}

pub(crate) struct EngineInner<G> {
    pub(crate) gateway: Arc<G>,
    pub(crate) settings: EngineSettings,
    pub(crate) policy: CallPolicy,
    pub(crate) risk: RiskGuard,
    pub(crate) run_id: String,
    /// Short prefix of `run_id` used in client order ids
    pub(crate) run_tag: String,
    pub(crate) core: Mutex<GridCore>,
    status: RwLock<EngineStatus>,
    state_tx: watch::Sender<EngineState>,
    /// Set once stop or a halt begins; loops check it before taking the lock
    pub(crate) halting: watch::Sender<bool>,
}

impl<G: ExchangeGateway + 'static> EngineInner<G> {
    pub(crate) fn is_halting(&self) -> bool {
        *self.halting.borrow()
    }

    /// Republish the status snapshot; call before releasing the lock
    pub(crate) async fn publish(&self, core: &GridCore) {
        let status = core.status(&self.run_id);
        self.state_tx.send_replace(core.state);
        *self.status.write().await = status;
    }

    /// Execute one ledger action and report the outcome back to the ledger
    pub(crate) async fn execute_action(&self, core: &mut GridCore, action: Action) -> GridResult<()> {
        let symbol = core.symbol();

        match action {
            Action::Place {
                level_index,
                side,
                price,
                quantity,
                reduce_only,
                client_id,
            } => {
                let request = OrderRequest::new(side, price, quantity)
                    .post_only(core.ledger.config().post_only)
                    .reduce_only(reduce_only)
                    .with_client_id(client_id.clone());

                debug!(
                    "Placing {} at level {} price {} size {}",
                    side.as_str(),
                    level_index,
                    price,
                    quantity
                );

                // Placements are not retried here: the next pass re-emits them
                match self
                    .policy
                    .once("place_order", self.gateway.place_order(&symbol, &request))
                    .await
                {
                    Ok(order_id) => {
                        core.ledger.record_placed(level_index, &client_id, order_id);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(
                            "Failed to place {} at level {} ({}): {}",
                            side.as_str(),
                            level_index,
                            price,
                            e
                        );
                        core.ledger.record_place_failed(level_index, &client_id);
                        Err(e)
                    }
                }
            }
            Action::Cancel { order_id } => {
                match self
                    .policy
                    .with_retry("cancel_order", || self.gateway.cancel_order(&symbol, &order_id))
                    .await
                {
                    Ok(()) => {
                        debug!("Cancelled order {}", order_id);
                        Ok(())
                    }
                    Err(GridError::OrderNotFound(_)) => {
                        debug!("Order {} already gone", order_id);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Failed to cancel order {}: {}", order_id, e);
                        core.ledger.record_cancel_failed(&order_id);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Cancel everything, optionally flatten, and end in `Stopped`
    ///
    /// Caller holds the lock. Gateway failures are logged; the engine still
    /// reaches `Stopped`.
    pub(crate) async fn halt_locked(
        &self,
        core: &mut GridCore,
        reason: HaltReason,
        close_position: bool,
    ) {
        if matches!(core.state, EngineState::Halting | EngineState::Stopped) {
            return;
        }

        self.halting.send_replace(true);
        warn!(
            "Halting epoch {}: {:?} (close position: {})",
            core.ledger.epoch_id(),
            reason,
            close_position
        );
        core.halt_reason = Some(reason);
        if let Err(e) = core.transition(EngineState::Halting) {
            error!("{}", e);
            core.state = EngineState::Halting;
        }
        self.publish(core).await;

        let symbol = core.symbol();
        match self
            .policy
            .with_retry("cancel_all", || self.gateway.cancel_all(&symbol))
            .await
        {
            Ok(count) => info!("Cancelled {} open orders on {}", count, symbol),
            Err(e) => error!("Failed to cancel open orders on {}: {}", symbol, e),
        }
        core.ledger.cancel_all_tracked();

        if close_position {
            match self
                .policy
                .with_retry("close_position_market", || {
                    self.gateway.close_position_market(&symbol)
                })
                .await
            {
                Ok(()) => info!("Closed position on {}", symbol),
                Err(e) => error!("Failed to close position on {}: {}", symbol, e),
            }
        }

        match self
            .policy
            .once("get_position", self.gateway.get_position(&symbol))
            .await
        {
            Ok(position) => core.position = position,
            Err(e) => warn!("Could not refresh final position: {}", e),
        }

        if let Err(e) = core.transition(EngineState::Stopped) {
            error!("{}", e);
            core.state = EngineState::Stopped;
        }
        self.publish(core).await;
        info!("Engine stopped, final position {}", core.position.size);
    }
}

/// Handle to a running grid engine
///
/// Cloning is cheap; every clone drives the same engine.
pub struct Engine<G: ExchangeGateway + 'static> {
    inner: Arc<EngineInner<G>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<G: ExchangeGateway + 'static> Clone for Engine<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            tasks: Arc::clone(&self.tasks),
        }
    }
}

impl<G: ExchangeGateway + 'static> Engine<G> {
    /// Validate, margin-check, seed the first epoch and start the loops
    ///
    /// Fails with `InvalidRange`/`InvalidConfig` or `InsufficientFunds`
    /// without placing anything.
    pub async fn start(
        gateway: Arc<G>,
        config: GridConfig,
        settings: EngineSettings,
    ) -> GridResult<Self> {
        config.validate()?;
        let ladder = GridLadder::build(&config)?;

        let policy = CallPolicy::from_settings(&settings);
        let risk = RiskGuard::new();
        let symbol = config.symbol.clone();

        info!(
            "Starting grid engine for {}: [{}, {}] x {} levels, {:?}/{:?}",
            symbol,
            config.lower_bound,
            config.upper_bound,
            config.level_count,
            config.spacing_mode,
            config.grid_mode
        );

        let price = policy
            .with_retry("get_current_price", || gateway.get_current_price(&symbol))
            .await?;
        let margin = policy
            .with_retry("get_available_margin", || {
                gateway.get_available_margin(&config.margin_asset)
            })
            .await?;
        risk.check_margin(price, margin, &config)?;

        let position = policy
            .with_retry("get_position", || gateway.get_position(&symbol))
            .await?;

        // Subscribe before the first placement so no fill is missed
        let fills = policy
            .with_retry("subscribe_fills", || gateway.subscribe_fills(&symbol))
            .await?;

        let run_id = Uuid::new_v4();
        let run_tag = run_id.simple().to_string()[..8].to_string();
        let ledger = OrderLedger::seed(1, run_tag.clone(), config, ladder, price, position);
        let core = GridCore::new(ledger, position, price);
        let run_id = run_id.to_string();

        let (state_tx, _) = watch::channel(core.state);
        let (halting, _) = watch::channel(false);

        let inner = Arc::new(EngineInner {
            status: RwLock::new(core.status(&run_id)),
            gateway,
            policy,
            risk,
            run_id,
            run_tag,
            core: Mutex::new(core),
            state_tx,
            halting,
            settings,
        });

        {
            let mut core = inner.core.lock().await;
            core.transition(EngineState::Running)?;
            inner.publish(&core).await;
        }

        if let Err(e) = inner.run_pass().await {
            warn!("Initial reconcile pass failed, retrying on schedule: {}", e);
        }

        let reconcile_task = tokio::spawn(Arc::clone(&inner).run_reconcile_loop());
        let fill_task = tokio::spawn(Arc::clone(&inner).run_fill_listener(fills));

        info!("Grid engine {} running", inner.run_id);

        Ok(Self {
            inner,
            tasks: Arc::new(Mutex::new(vec![reconcile_task, fill_task])),
        })
    }

    /// Cancel all orders, close the position if configured, and stop the loops
    pub async fn stop(&self) -> GridResult<()> {
        self.inner.halting.send_replace(true);

        {
            let mut core = self.inner.core.lock().await;
            self.inner
                .halt_locked(
                    &mut core,
                    HaltReason::StopRequested,
                    self.inner.settings.close_position_on_stop,
                )
                .await;
        }

        self.join_tasks().await;
        Ok(())
    }

    /// Move the range; `None` keeps the current bound
    pub async fn adjust_range(&self, new_lower: Option<f64>, new_upper: Option<f64>) -> GridResult<()> {
        self.inner.adjust_range(new_lower, new_upper).await
    }

    /// Run one reconciliation pass now
    pub async fn reconcile_now(&self) -> GridResult<PassOutcome> {
        self.inner.run_pass().await
    }

    /// Last published status; never blocks on the engine lock
    pub async fn status(&self) -> EngineStatus {
        self.inner.status.read().await.clone()
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state_tx.borrow()
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Resolve once the engine reaches `Stopped`, then reap the loop tasks
    pub async fn wait_until_stopped(&self) {
        let mut state = self.inner.state_tx.subscribe();
        if state.wait_for(|s| *s == EngineState::Stopped).await.is_err() {
            warn!("State channel closed before the engine stopped");
        }
        self.join_tasks().await;
    }

    async fn join_tasks(&self) {
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Engine task ended abnormally: {}", e);
            }
        }
    }
}
