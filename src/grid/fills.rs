//! Fill listener: applies streamed fills and places mirror orders

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::watch;

use super::engine::EngineInner;
use super::gateway::{ExchangeGateway, FillStream};
use super::ledger::FillOutcome;
use super::types::FillEvent;

impl<G: ExchangeGateway + 'static> EngineInner<G> {
    pub(crate) async fn run_fill_listener(self: Arc<Self>, mut stream: FillStream) {
        let mut halting = self.halting.subscribe();

        loop {
            if self.is_halting() {
                break;
            }

            tokio::select! {
                changed = halting.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = stream.next() => match event {
                    Some(fill) => self.handle_fill(fill).await,
                    None => {
                        if self.is_halting() {
                            break;
                        }
                        warn!("Fill stream ended, resubscribing");
                        match self.resubscribe(&mut halting).await {
                            Some(next) => stream = next,
                            None => break,
                        }
                    }
                },
            }
        }

        info!("Fill listener exited");
    }

    /// Apply one fill under the engine lock; the mirror placement happens
    /// inside the critical section
    pub(crate) async fn handle_fill(&self, fill: FillEvent) {
        if self.is_halting() {
            debug!("Dropping fill {} while halting", fill.order_id);
            return;
        }

        let mut core = self.core.lock().await;
        if !core.state.is_live() {
            return;
        }

        match core
            .ledger
            .apply_fill(&fill.order_id, fill.filled_qty, fill.fill_price)
        {
            FillOutcome::Ignored => return,
            FillOutcome::Partial { .. } | FillOutcome::Filled { mirror: None } => {}
            FillOutcome::Filled {
                mirror: Some(action),
            } => {
                if let Err(e) = self.execute_action(&mut core, action).await {
                    warn!("Mirror order failed, reconcile will retry: {}", e);
                }
            }
        }

        self.publish(&core).await;
    }

    /// Re-subscribe with a fixed delay until it works or the engine halts
    async fn resubscribe(&self, halting: &mut watch::Receiver<bool>) -> Option<FillStream> {
        let delay = self.settings.resubscribe_delay();
        let symbol = self.core.lock().await.symbol();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = halting.changed() => {
                    if changed.is_err() || self.is_halting() {
                        return None;
                    }
                }
            }

            if self.is_halting() {
                return None;
            }

            match self
                .policy
                .once("subscribe_fills", self.gateway.subscribe_fills(&symbol))
                .await
            {
                Ok(stream) => {
                    info!("Re-subscribed to fills for {}", symbol);
                    return Some(stream);
                }
                Err(e) => warn!("Fill re-subscription failed: {}", e),
            }
        }
    }
}
