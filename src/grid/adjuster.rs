//! Live range adjustment under the engine lock

use log::{info, warn};

use super::config::GridConfig;
use super::engine::{EngineInner, GridCore};
use super::errors::{GridError, GridResult};
use super::gateway::ExchangeGateway;
use super::ledger::OrderLedger;
use super::model::GridLadder;
use super::types::EngineState;

impl<G: ExchangeGateway + 'static> EngineInner<G> {
    /// Replace the range; either bound may be omitted to keep its current value
    pub(crate) async fn adjust_range(
        &self,
        new_lower: Option<f64>,
        new_upper: Option<f64>,
    ) -> GridResult<()> {
        {
            let mut core = self.core.lock().await;
            core.require_running()?;
            let target = core.ledger.config().with_bounds(new_lower, new_upper);
            self.adjust_locked(&mut core, target).await?;
        }

        // Seed the new epoch right away instead of waiting for the timer
        if let Err(e) = self.run_pass().await {
            warn!("Post-adjust reconcile failed, retrying on schedule: {}", e);
        }
        Ok(())
    }

    /// Cancel the current epoch, margin-check `target` and seed it
    ///
    /// Caller holds the lock and the engine is `Running`. On any failure the
    /// previous config stays in force; its cancelled levels are re-placed by
    /// the next reconcile pass.
    pub(crate) async fn adjust_locked(&self, core: &mut GridCore, target: GridConfig) -> GridResult<()> {
        // Bad ranges are rejected before anything is cancelled
        target.validate()?;
        let ladder = GridLadder::build(&target)?;

        core.transition(EngineState::AdjustingRange)?;
        self.publish(core).await;

        let previous = core.ledger.config().clone();
        info!(
            "Adjusting {} range [{}, {}] -> [{}, {}]",
            previous.symbol,
            previous.lower_bound,
            previous.upper_bound,
            target.lower_bound,
            target.upper_bound
        );

        let symbol = previous.symbol.clone();
        for order_id in core.ledger.cancel_all_tracked() {
            match self
                .policy
                .with_retry("cancel_order", || self.gateway.cancel_order(&symbol, &order_id))
                .await
            {
                Ok(()) | Err(GridError::OrderNotFound(_)) => {}
                Err(e) => warn!("Failed to cancel {} during adjustment: {}", order_id, e),
            }
        }

        let checked = async {
            let price = self
                .policy
                .with_retry("get_current_price", || self.gateway.get_current_price(&symbol))
                .await?;
            let margin = self
                .policy
                .with_retry("get_available_margin", || {
                    self.gateway.get_available_margin(&target.margin_asset)
                })
                .await?;
            self.risk.check_margin(price, margin, &target)?;
            let position = self
                .policy
                .with_retry("get_position", || self.gateway.get_position(&symbol))
                .await?;
            Ok::<_, GridError>((price, position))
        }
        .await;

        let (price, position) = match checked {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    "Range adjustment rejected, keeping [{}, {}]: {}",
                    previous.lower_bound, previous.upper_bound, e
                );
                core.transition(EngineState::Running)?;
                self.publish(core).await;
                return Err(e);
            }
        };

        let epoch_id = core.ledger.epoch_id() + 1;
        core.ledger = OrderLedger::seed(
            epoch_id,
            self.run_tag.clone(),
            target,
            ladder,
            price,
            position,
        );
        core.position = position;
        core.last_price = Some(price);
        core.transition(EngineState::Running)?;
        self.publish(core).await;

        info!("Epoch {} live on {}", epoch_id, symbol);
        Ok(())
    }
}
