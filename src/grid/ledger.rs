//! Order ledger: the grid's local view of which level holds which order
//!
//! The ledger never talks to the exchange. It turns remote snapshots and fill
//! events into [`Action`]s and is told the outcome of executing them.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{debug, info, warn};

use super::config::{GridConfig, GridMode};
use super::model::GridLadder;
use super::types::{
    Action, GridLevel, GridOrder, LevelView, OrderId, OrderSide, OrderStatus, PositionState,
    RemoteOrder, RemoteSnapshot,
};

const QTY_EPSILON: f64 = 1e-9;

/// Snapshots an open order must be missing from before its level is re-seeded
const VANISHED_AFTER_SNAPSHOTS: u32 = 2;

/// Result of applying a fill event
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Unknown order, duplicate delivery, or an order from another epoch
    Ignored,
    /// Order still has unfilled quantity
    Partial { remaining: f64 },
    /// Order completed; `mirror` is the order to seed at the adjacent level
    Filled { mirror: Option<Action> },
}

/// Authoritative local state of one grid epoch
#[derive(Debug, Clone)]
pub struct OrderLedger {
    epoch_id: u64,
    run_tag: String,
    config: GridConfig,
    ladder: GridLadder,
    reference_index: u32,
    /// Side each level should be covered with
    desired: Vec<Option<OrderSide>>,
    /// At most one non-terminal order per level
    live: Vec<Option<GridOrder>>,
    /// Cancels issued and not yet confirmed by a snapshot
    pending_cancels: HashSet<OrderId>,
    /// Position from the last snapshot
    position_baseline: f64,
    /// Signed fill quantities applied since, stamped when applied
    fill_deltas: Vec<(Instant, f64)>,
    next_seq: u64,
}

impl OrderLedger {
    /// Seed a new epoch around `reference_price`
    ///
    /// The level closest to the reference price stays uncovered. Neutral grids
    /// buy below and sell above it, long-only grids only buy below it and
    /// short-only grids only sell above it.
    pub fn seed(
        epoch_id: u64,
        run_tag: impl Into<String>,
        config: GridConfig,
        ladder: GridLadder,
        reference_price: f64,
        position: PositionState,
    ) -> Self {
        let reference_index = ladder.reference_index(reference_price);

        let desired: Vec<Option<OrderSide>> = ladder
            .levels()
            .iter()
            .map(|level| initial_side(config.grid_mode, level.index, reference_index))
            .collect();

        let live = ladder
            .levels()
            .iter()
            .zip(&desired)
            .map(|(level, side)| side.map(|s| GridOrder::pending(level, s, config.order_quantity)))
            .collect();

        info!(
            "Seeded epoch {} for {}: {} levels [{}, {}], reference level {} @ {}",
            epoch_id,
            config.symbol,
            ladder.len(),
            config.lower_bound,
            config.upper_bound,
            reference_index,
            reference_price
        );

        Self {
            epoch_id,
            run_tag: run_tag.into(),
            config,
            ladder,
            reference_index,
            desired,
            live,
            pending_cancels: HashSet::new(),
            position_baseline: position.size,
            fill_deltas: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn ladder(&self) -> &GridLadder {
        &self.ladder
    }

    pub fn reference_index(&self) -> u32 {
        self.reference_index
    }

    pub fn desired_side(&self, level_index: u32) -> Option<OrderSide> {
        self.desired.get(level_index as usize).copied().flatten()
    }

    pub fn order_at(&self, level_index: u32) -> Option<&GridOrder> {
        self.live.get(level_index as usize).and_then(|o| o.as_ref())
    }

    /// Last pulled position plus fill deltas since
    pub fn expected_position(&self) -> f64 {
        self.position_baseline + self.fill_deltas.iter().map(|(_, delta)| delta).sum::<f64>()
    }

    /// Exchange ids of every open order the ledger tracks
    pub fn open_order_ids(&self) -> Vec<OrderId> {
        self.live
            .iter()
            .flatten()
            .filter(|o| o.status == OrderStatus::Open)
            .filter_map(|o| o.exchange_order_id.clone())
            .collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.live
            .iter()
            .flatten()
            .filter(|o| o.status == OrderStatus::Open)
            .count()
    }

    pub fn level_views(&self) -> Vec<LevelView> {
        self.ladder
            .levels()
            .iter()
            .map(|level| {
                let order = self.order_at(level.index);
                LevelView {
                    index: level.index,
                    price: level.price,
                    desired_side: self.desired_side(level.index),
                    order_status: order.map(|o| o.status),
                    order_id: order.and_then(|o| o.exchange_order_id.clone()),
                }
            })
            .collect()
    }

    /// Diff the remote snapshot against local intent
    ///
    /// Emits `Place` for every desired level without a matching remote order and
    /// `Cancel` for every remote order that matches no desired level. When two
    /// remote orders claim one level, all but the most recently placed are
    /// cancelled. Calling this twice with the same snapshot yields no actions
    /// the second time.
    pub fn reconcile(&mut self, snapshot: &RemoteSnapshot) -> Vec<Action> {
        // Fills applied after the snapshot was taken are not in its position
        self.position_baseline = snapshot.position.size;
        self.fill_deltas.retain(|(at, _)| *at > snapshot.taken_at);

        let remote_ids: HashSet<&str> = snapshot
            .open_orders
            .iter()
            .map(|o| o.order_id.as_str())
            .collect();
        self.pending_cancels
            .retain(|id| remote_ids.contains(id.as_str()));

        let mut actions = Vec::new();

        // Attribute every remote order to a level, or mark it stale
        let mut claims: HashMap<u32, Vec<&RemoteOrder>> = HashMap::new();
        for remote in &snapshot.open_orders {
            if self.pending_cancels.contains(&remote.order_id) {
                continue;
            }
            match self.claimed_level(remote) {
                Some(level) => claims.entry(level).or_default().push(remote),
                None => {
                    debug!(
                        "Stale remote order {} ({} {} @ {})",
                        remote.order_id,
                        remote.side.as_str(),
                        remote.quantity,
                        remote.price
                    );
                    self.request_cancel(remote.order_id.clone(), &mut actions);
                }
            }
        }

        let mut claimed_levels: Vec<u32> = claims.keys().copied().collect();
        claimed_levels.sort_unstable();

        let mut covered = HashSet::new();
        for level in claimed_levels {
            let Some(mut remotes) = claims.remove(&level) else {
                continue;
            };
            remotes.sort_by_key(|r| r.placed_at);
            let Some(keep) = remotes.pop() else {
                continue;
            };
            for duplicate in remotes {
                warn!(
                    "Level {} has duplicate remote order {}, keeping {}",
                    level, duplicate.order_id, keep.order_id
                );
                self.request_cancel(duplicate.order_id.clone(), &mut actions);
            }
            self.adopt(level, &keep.order_id, keep.client_id.clone());
            if let Some(order) = self.live[level as usize].as_mut() {
                order.missed_snapshots = 0;
            }
            covered.insert(level);
        }

        // Drop local orders on levels that no longer need coverage
        for index in 0..self.live.len() {
            if self.desired[index].is_none() {
                if let Some(order) = self.live[index].take() {
                    self.retire(order);
                }
            }
        }

        // Nearest levels first so the position budget goes to them
        let mut candidates: Vec<u32> = (0..self.ladder.len() as u32)
            .filter(|i| self.desired_side(*i).is_some() && !covered.contains(i))
            .collect();
        candidates.sort_by_key(|i| (i.abs_diff(self.reference_index), *i));

        for index in candidates {
            if let Some(action) = self.ensure_coverage(index, snapshot) {
                actions.push(action);
            }
        }

        if !actions.is_empty() {
            info!(
                "Epoch {} reconcile: {} place, {} cancel",
                self.epoch_id,
                actions.iter().filter(|a| a.is_place()).count(),
                actions.iter().filter(|a| a.is_cancel()).count()
            );
        }

        actions
    }

    /// Apply a fill; returns the mirror order to place, if any
    ///
    /// A buy fill at level i seeds a sell at i+1, a sell fill at level i seeds a
    /// buy at i-1. The filled level becomes the grid's uncovered level.
    pub fn apply_fill(&mut self, order_id: &str, fill_qty: f64, fill_price: f64) -> FillOutcome {
        let Some(index) = self.level_of_order(order_id) else {
            debug!("Fill for unknown or closed order {} ignored", order_id);
            return FillOutcome::Ignored;
        };

        let Some(order) = self.live[index as usize].as_mut() else {
            return FillOutcome::Ignored;
        };

        let side = order.side;
        let qty = fill_qty.min(order.remaining_quantity());
        self.fill_deltas.push((Instant::now(), side.sign() * qty));

        if !order.apply_fill(qty) {
            let remaining = order.remaining_quantity();
            info!(
                "Partial fill: level={}, oid={}, qty={}, price={}, remaining={}",
                index, order_id, qty, fill_price, remaining
            );
            return FillOutcome::Partial { remaining };
        }

        info!(
            "Fill: level={}, side={}, oid={}, price={}",
            index,
            side.as_str(),
            order_id,
            fill_price
        );

        if let Some(filled) = self.live[index as usize].take() {
            self.retire(filled);
        }
        self.desired[index as usize] = None;

        let mirror_index = match side {
            OrderSide::Buy => index.checked_add(1).filter(|i| (*i as usize) < self.ladder.len()),
            OrderSide::Sell => index.checked_sub(1),
        };

        let Some(mirror_index) = mirror_index else {
            info!("Fill at edge level {}, no mirror level", index);
            return FillOutcome::Filled { mirror: None };
        };

        let mirror_side = side.opposite();
        if self.is_reduce_only(mirror_side) && !self.can_reduce(mirror_side) {
            warn!(
                "Skipping {} mirror at level {}: would open against {:?} grid",
                mirror_side.as_str(),
                mirror_index,
                self.config.grid_mode
            );
            return FillOutcome::Filled { mirror: None };
        }

        self.desired[mirror_index as usize] = Some(mirror_side);

        let slot = &mut self.live[mirror_index as usize];
        match slot.take() {
            Some(existing) if existing.is_live() && existing.side == mirror_side => {
                *slot = Some(existing);
                return FillOutcome::Filled { mirror: None };
            }
            Some(existing) => {
                warn!(
                    "Level {} held a {} order, replacing with {} mirror",
                    mirror_index,
                    existing.side.as_str(),
                    mirror_side.as_str()
                );
                self.retire(existing);
            }
            None => {}
        }

        let level = self.level(mirror_index);
        self.live[mirror_index as usize] =
            Some(GridOrder::pending(&level, mirror_side, self.config.order_quantity));

        FillOutcome::Filled {
            mirror: self.submit(mirror_index),
        }
    }

    /// Placement acknowledged by the exchange
    pub fn record_placed(&mut self, level_index: u32, client_id: &str, order_id: OrderId) -> bool {
        match self.live.get_mut(level_index as usize).and_then(|o| o.as_mut()) {
            Some(order) if order.in_flight && order.client_id.as_deref() == Some(client_id) => {
                debug!("Level {} now open as {}", level_index, order_id);
                order.mark_open(order_id);
                true
            }
            _ => {
                warn!(
                    "Placement {} for level {} no longer tracked (oid {})",
                    client_id, level_index, order_id
                );
                false
            }
        }
    }

    /// Placement failed; the level stays pending and is retried next pass
    pub fn record_place_failed(&mut self, level_index: u32, client_id: &str) {
        if let Some(order) = self.live.get_mut(level_index as usize).and_then(|o| o.as_mut()) {
            if order.client_id.as_deref() == Some(client_id) {
                order.mark_submit_failed();
            }
        }
    }

    /// Cancel failed; forget it so the next pass issues it again
    pub fn record_cancel_failed(&mut self, order_id: &str) {
        self.pending_cancels.remove(order_id);
    }

    /// Mark every tracked order cancelled and re-arm the levels as pending
    ///
    /// Returns the exchange ids that must be cancelled remotely. Desired
    /// coverage is kept, so the next reconcile re-places the levels unless the
    /// ledger is replaced first.
    pub fn cancel_all_tracked(&mut self) -> Vec<OrderId> {
        let mut ids = Vec::new();
        for index in 0..self.live.len() {
            let Some(order) = self.live[index].take() else {
                continue;
            };
            if let Some(id) = order.exchange_order_id.clone() {
                ids.push(id);
            }
            let side = order.side;
            self.retire(order);

            let level = self.level(index as u32);
            self.live[index] = Some(GridOrder::pending(&level, side, self.config.order_quantity));
        }
        ids
    }

    fn level(&self, index: u32) -> GridLevel {
        self.ladder
            .get(index)
            .copied()
            .unwrap_or(GridLevel { index, price: 0.0 })
    }

    fn level_of_order(&self, order_id: &str) -> Option<u32> {
        self.live.iter().flatten().find_map(|o| {
            (o.is_live() && o.exchange_order_id.as_deref() == Some(order_id)).then_some(o.level_index)
        })
    }

    fn claimed_level(&self, remote: &RemoteOrder) -> Option<u32> {
        if let Some(index) = self.level_of_order(&remote.order_id) {
            if self.desired_side(index) == Some(remote.side) {
                return Some(index);
            }
            return None;
        }

        let (run_tag, epoch, level) = remote.client_id.as_deref().and_then(parse_client_id)?;
        if run_tag != self.run_tag || epoch != self.epoch_id {
            return None;
        }
        if self.desired_side(level) != Some(remote.side) {
            return None;
        }
        (self.ladder.match_price(remote.price) == Some(level)).then_some(level)
    }

    fn adopt(&mut self, index: u32, order_id: &str, client_id: Option<String>) {
        let already_tracked = self
            .order_at(index)
            .is_some_and(|o| o.exchange_order_id.as_deref() == Some(order_id));
        if already_tracked {
            return;
        }

        let Some(side) = self.desired_side(index) else {
            return;
        };
        let level = self.level(index);

        if let Some(previous) = self.live[index as usize].take() {
            self.retire(previous);
        }

        info!("Adopting remote order {} for level {}", order_id, index);
        let mut order = GridOrder::pending(&level, side, self.config.order_quantity);
        order.client_id = client_id;
        order.mark_open(order_id.to_string());
        self.live[index as usize] = Some(order);
    }

    fn ensure_coverage(&mut self, index: u32, snapshot: &RemoteSnapshot) -> Option<Action> {
        let side = self.desired_side(index)?;
        let level = self.level(index);
        let quantity = self.config.order_quantity;

        let slot = self.live[index as usize].take();
        let order = match slot {
            Some(order) if order.in_flight => {
                self.live[index as usize] = Some(order);
                return None;
            }
            Some(order) if order.side != side => {
                self.retire(order);
                GridOrder::pending(&level, side, quantity)
            }
            Some(order) if order.status == OrderStatus::Open => {
                let acked_after_snapshot = order
                    .acknowledged_at
                    .map(|at| at > snapshot.taken_at)
                    .unwrap_or(false);
                if acked_after_snapshot {
                    self.live[index as usize] = Some(order);
                    return None;
                }

                // A fill can remove the order before its event arrives, so one
                // missing snapshot is not enough
                let mut order = order;
                order.missed_snapshots += 1;
                if order.missed_snapshots < VANISHED_AFTER_SNAPSHOTS {
                    debug!(
                        "Order {:?} at level {} missing from snapshot",
                        order.exchange_order_id, index
                    );
                    self.live[index as usize] = Some(order);
                    return None;
                }
                warn!(
                    "Order {:?} at level {} vanished from the exchange, re-seeding",
                    order.exchange_order_id, index
                );
                self.retire(order);
                GridOrder::pending(&level, side, quantity)
            }
            Some(order) => order,
            None => GridOrder::pending(&level, side, quantity),
        };
        self.live[index as usize] = Some(order);

        self.submit(index)
    }

    /// Mark the pending order at `index` as submitted and build its Place action
    fn submit(&mut self, index: u32) -> Option<Action> {
        let (side, price, quantity) = {
            let order = self.live[index as usize].as_ref()?;
            (order.side, order.price, order.remaining_quantity())
        };

        let reduce_only = self.is_reduce_only(side);
        if !reduce_only && !self.within_position_limit(side, quantity) {
            debug!(
                "Withholding {} at level {}: max_position {} reached",
                side.as_str(),
                index,
                self.config.max_position
            );
            return None;
        }

        let client_id = self.next_client_id(index);
        if let Some(order) = self.live[index as usize].as_mut() {
            order.mark_submitted(client_id.clone());
        }

        Some(Action::Place {
            level_index: index,
            side,
            price,
            quantity,
            reduce_only,
            client_id,
        })
    }

    fn request_cancel(&mut self, order_id: OrderId, actions: &mut Vec<Action>) {
        if self.pending_cancels.insert(order_id.clone()) {
            actions.push(Action::Cancel { order_id });
        }
    }

    /// Drop an order from tracking; anything not yet filled ends cancelled
    fn retire(&self, mut order: GridOrder) {
        if order.is_live() {
            order.mark_cancelled();
        }
        debug!(
            "Epoch {} level {} order {:?} retired as {:?}",
            self.epoch_id, order.level_index, order.exchange_order_id, order.status
        );
    }

    fn is_reduce_only(&self, side: OrderSide) -> bool {
        matches!(
            (self.config.grid_mode, side),
            (GridMode::LongOnly, OrderSide::Sell) | (GridMode::ShortOnly, OrderSide::Buy)
        )
    }

    /// Whether a reduce-only order of `side` still has position to reduce
    fn can_reduce(&self, side: OrderSide) -> bool {
        let qty = self.config.order_quantity * (1.0 - QTY_EPSILON);
        match side {
            OrderSide::Sell => self.expected_position() >= qty,
            OrderSide::Buy => self.expected_position() <= -qty,
        }
    }

    /// Worst case exposure if every resting order of `side` fills, plus this one
    fn within_position_limit(&self, side: OrderSide, quantity: f64) -> bool {
        let committed: f64 = self
            .live
            .iter()
            .flatten()
            .filter(|o| o.side == side && (o.in_flight || o.status == OrderStatus::Open))
            .map(|o| o.remaining_quantity())
            .sum();

        let directional_position = side.sign() * self.expected_position();
        directional_position + committed + quantity <= self.config.max_position + QTY_EPSILON
    }

    fn next_client_id(&mut self, level_index: u32) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        format!("{}-{}-{}-{}", self.run_tag, self.epoch_id, level_index, seq)
    }
}

fn initial_side(mode: GridMode, index: u32, reference: u32) -> Option<OrderSide> {
    use std::cmp::Ordering;
    match (mode, index.cmp(&reference)) {
        (_, Ordering::Equal) => None,
        (GridMode::Neutral | GridMode::LongOnly, Ordering::Less) => Some(OrderSide::Buy),
        (GridMode::Neutral | GridMode::ShortOnly, Ordering::Greater) => Some(OrderSide::Sell),
        _ => None,
    }
}

/// Split `<run>-<epoch>-<level>-<seq>` into its run tag, epoch and level
pub fn parse_client_id(client_id: &str) -> Option<(&str, u64, u32)> {
    let mut parts = client_id.split('-');
    let run_tag = parts.next()?;
    let epoch = parts.next()?.parse().ok()?;
    let level = parts.next()?.parse().ok()?;
    parts.next()?.parse::<u64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((run_tag, epoch, level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const RUN: &str = "abcd1234";

    fn config(mode: GridMode) -> GridConfig {
        GridConfig::new("SOL_USDC_PERP", 100.0, 120.0, 5, 1.0, 10.0).with_grid_mode(mode)
    }

    fn ledger_at(mode: GridMode, price: f64) -> OrderLedger {
        let config = config(mode);
        let ladder = GridLadder::build(&config).unwrap();
        OrderLedger::seed(1, RUN, config, ladder, price, PositionState::default())
    }

    fn snapshot(orders: Vec<RemoteOrder>, position: f64) -> RemoteSnapshot {
        RemoteSnapshot {
            price: 111.0,
            open_orders: orders,
            position: PositionState::new(position, 110.0),
            taken_at: Instant::now(),
        }
    }

    fn remote(id: &str, side: OrderSide, price: f64, placed_at: u64) -> RemoteOrder {
        RemoteOrder {
            order_id: id.to_string(),
            client_id: None,
            side,
            price,
            quantity: 1.0,
            placed_at,
        }
    }

    /// Execute every Place action as if the exchange accepted it
    fn accept_all(ledger: &mut OrderLedger, actions: &[Action]) -> Vec<RemoteOrder> {
        let mut remotes = Vec::new();
        for (n, action) in actions.iter().enumerate() {
            if let Action::Place {
                level_index,
                side,
                price,
                client_id,
                ..
            } = action
            {
                let id = format!("oid-{}-{}", level_index, n);
                assert!(ledger.record_placed(*level_index, client_id, id.clone()));
                remotes.push(RemoteOrder {
                    order_id: id,
                    client_id: Some(client_id.clone()),
                    side: *side,
                    price: *price,
                    quantity: 1.0,
                    placed_at: n as u64,
                });
            }
        }
        remotes
    }

    #[test]
    fn test_seed_neutral_sides() {
        let ledger = ledger_at(GridMode::Neutral, 111.0);
        assert_eq!(ledger.reference_index(), 2);
        assert_eq!(ledger.desired_side(0), Some(OrderSide::Buy));
        assert_eq!(ledger.desired_side(1), Some(OrderSide::Buy));
        assert_eq!(ledger.desired_side(2), None);
        assert_eq!(ledger.desired_side(3), Some(OrderSide::Sell));
        assert_eq!(ledger.desired_side(4), Some(OrderSide::Sell));
    }

    #[test]
    fn test_seed_long_and_short_only() {
        let long = ledger_at(GridMode::LongOnly, 111.0);
        assert_eq!(long.desired_side(1), Some(OrderSide::Buy));
        assert_eq!(long.desired_side(3), None);
        assert_eq!(long.desired_side(4), None);

        let short = ledger_at(GridMode::ShortOnly, 111.0);
        assert_eq!(short.desired_side(0), None);
        assert_eq!(short.desired_side(1), None);
        assert_eq!(short.desired_side(3), Some(OrderSide::Sell));
    }

    #[test]
    fn test_reconcile_places_missing_levels_and_is_idempotent() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let snap = snapshot(vec![], 0.0);

        let actions = ledger.reconcile(&snap);
        assert_eq!(actions.len(), 4);
        assert!(actions.iter().all(|a| a.is_place()));
        // Nearest levels come first
        assert!(matches!(actions[0], Action::Place { level_index: 1, .. }));

        let again = ledger.reconcile(&snap);
        assert!(again.is_empty());
    }

    #[test]
    fn test_reconcile_settles_after_execution() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        let remotes = accept_all(&mut ledger, &actions);
        assert_eq!(ledger.open_order_count(), 4);

        let snap = snapshot(remotes, 0.0);
        assert!(ledger.reconcile(&snap).is_empty());
        assert!(ledger.reconcile(&snap).is_empty());
    }

    #[test]
    fn test_reconcile_cancels_stale_orders() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);

        let manual = remote("manual-1", OrderSide::Buy, 101.3, 5);
        let old_epoch = RemoteOrder {
            client_id: Some(format!("{}-0-1-7", RUN)),
            ..remote("old-1", OrderSide::Buy, 105.0, 6)
        };
        let wrong_side = RemoteOrder {
            client_id: Some(format!("{}-1-1-9", RUN)),
            ..remote("wrong-1", OrderSide::Sell, 105.0, 7)
        };

        let snap = snapshot(vec![manual, old_epoch, wrong_side], 0.0);
        let actions = ledger.reconcile(&snap);

        let cancels: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Cancel { order_id } => Some(order_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(cancels, vec!["manual-1", "old-1", "wrong-1"]);
        assert_eq!(actions.iter().filter(|a| a.is_place()).count(), 4);

        // Cancels are not repeated while the snapshot still shows them
        assert!(ledger.reconcile(&snap).is_empty());
    }

    #[test]
    fn test_failed_cancel_is_retried() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let snap = snapshot(vec![remote("manual-1", OrderSide::Buy, 101.3, 5)], 0.0);

        let actions = ledger.reconcile(&snap);
        assert!(actions.contains(&Action::Cancel {
            order_id: "manual-1".into()
        }));

        ledger.record_cancel_failed("manual-1");
        let retry = ledger.reconcile(&snap);
        assert_eq!(
            retry,
            vec![Action::Cancel {
                order_id: "manual-1".into()
            }]
        );
    }

    #[test]
    fn test_duplicate_orders_keep_most_recent() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let older = RemoteOrder {
            client_id: Some(format!("{}-1-1-0", RUN)),
            ..remote("older", OrderSide::Buy, 105.0, 10)
        };
        let newer = RemoteOrder {
            client_id: Some(format!("{}-1-1-3", RUN)),
            ..remote("newer", OrderSide::Buy, 105.0, 20)
        };

        let actions = ledger.reconcile(&snapshot(vec![newer, older], 0.0));
        assert!(actions.contains(&Action::Cancel {
            order_id: "older".into()
        }));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Place { level_index: 1, .. })));
        assert_eq!(
            ledger.order_at(1).and_then(|o| o.exchange_order_id.clone()),
            Some("newer".to_string())
        );
    }

    #[test]
    fn test_failed_placement_is_retried() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let snap = snapshot(vec![], 0.0);
        let actions = ledger.reconcile(&snap);

        for action in &actions {
            if let Action::Place {
                level_index,
                client_id,
                ..
            } = action
            {
                ledger.record_place_failed(*level_index, client_id);
            }
        }

        let retry = ledger.reconcile(&snap);
        assert_eq!(retry.len(), 4);
        assert!(retry.iter().all(|a| a.is_place()));
    }

    #[test]
    fn test_vanished_order_is_reseeded() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        let mut remotes = accept_all(&mut ledger, &actions);

        // Level 0 order disappears from the exchange
        remotes.retain(|r| r.price != 100.0);
        assert!(ledger.reconcile(&snapshot(remotes.clone(), 0.0)).is_empty());
        let actions = ledger.reconcile(&snapshot(remotes, 0.0));

        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            Action::Place {
                level_index: 0,
                side: OrderSide::Buy,
                ..
            }
        ));
    }

    #[test]
    fn test_order_acked_after_snapshot_is_not_vanished() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let early = snapshot(vec![], 0.0);

        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        std::thread::sleep(std::time::Duration::from_millis(2));
        accept_all(&mut ledger, &actions);

        // Snapshot taken before the acknowledgements does not list them
        assert!(ledger.reconcile(&early).is_empty());
    }

    #[test]
    fn test_buy_fill_seeds_sell_one_level_up() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        accept_all(&mut ledger, &actions);

        let oid = ledger.order_at(1).unwrap().exchange_order_id.clone().unwrap();
        let outcome = ledger.apply_fill(&oid, 1.0, 105.0);

        match outcome {
            FillOutcome::Filled {
                mirror:
                    Some(Action::Place {
                        level_index,
                        side,
                        price,
                        quantity,
                        reduce_only,
                        ..
                    }),
            } => {
                assert_eq!(level_index, 2);
                assert_eq!(side, OrderSide::Sell);
                assert_eq!(price, 110.0);
                assert_eq!(quantity, 1.0);
                assert!(!reduce_only);
            }
            other => panic!("expected mirror placement, got {:?}", other),
        }

        assert_eq!(ledger.desired_side(1), None);
        assert_eq!(ledger.desired_side(2), Some(OrderSide::Sell));
        assert!((ledger.expected_position() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fill_is_idempotent() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        accept_all(&mut ledger, &actions);

        let oid = ledger.order_at(1).unwrap().exchange_order_id.clone().unwrap();
        assert!(matches!(
            ledger.apply_fill(&oid, 1.0, 105.0),
            FillOutcome::Filled { mirror: Some(_) }
        ));
        assert_eq!(ledger.apply_fill(&oid, 1.0, 105.0), FillOutcome::Ignored);
        assert_eq!(ledger.apply_fill("never-seen", 1.0, 105.0), FillOutcome::Ignored);
        assert!((ledger.expected_position() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_fills_accumulate() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        accept_all(&mut ledger, &actions);
        let oid = ledger.order_at(3).unwrap().exchange_order_id.clone().unwrap();

        assert_eq!(
            ledger.apply_fill(&oid, 0.4, 115.0),
            FillOutcome::Partial { remaining: 0.6 }
        );
        match ledger.apply_fill(&oid, 0.6, 115.0) {
            FillOutcome::Filled {
                mirror: Some(Action::Place {
                    level_index, side, ..
                }),
            } => {
                assert_eq!(level_index, 2);
                assert_eq!(side, OrderSide::Buy);
            }
            other => panic!("expected buy mirror, got {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_restores_coverage() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        accept_all(&mut ledger, &actions);
        let initial: Vec<_> = (0..5).map(|i| ledger.desired_side(i)).collect();

        // Buy at level 1 fills, sell mirror at level 2 goes live
        let buy_oid = ledger.order_at(1).unwrap().exchange_order_id.clone().unwrap();
        let FillOutcome::Filled {
            mirror: Some(Action::Place { client_id, .. }),
        } = ledger.apply_fill(&buy_oid, 1.0, 105.0)
        else {
            panic!("expected sell mirror");
        };
        assert!(ledger.record_placed(2, &client_id, "mirror-sell".into()));

        // The mirror sell fills, a buy is seeded back at level 1
        let FillOutcome::Filled {
            mirror: Some(Action::Place {
                level_index,
                side,
                client_id,
                ..
            }),
        } = ledger.apply_fill("mirror-sell", 1.0, 110.0)
        else {
            panic!("expected buy mirror");
        };
        assert_eq!(level_index, 1);
        assert_eq!(side, OrderSide::Buy);
        assert!(ledger.record_placed(1, &client_id, "rebuy".into()));

        let after: Vec<_> = (0..5).map(|i| ledger.desired_side(i)).collect();
        assert_eq!(after, initial);
        assert!(ledger.expected_position().abs() < 1e-12);
        assert_eq!(ledger.open_order_count(), 4);
    }

    #[test]
    fn test_mirror_replaces_opposite_order() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        let remotes = accept_all(&mut ledger, &actions);
        let old_sell = ledger.order_at(3).unwrap().exchange_order_id.clone().unwrap();

        // Top sell fills before the one below it
        let top = ledger.order_at(4).unwrap().exchange_order_id.clone().unwrap();
        let FillOutcome::Filled {
            mirror: Some(Action::Place {
                level_index, side, ..
            }),
        } = ledger.apply_fill(&top, 1.0, 120.0)
        else {
            panic!("expected buy mirror");
        };
        assert_eq!(level_index, 3);
        assert_eq!(side, OrderSide::Buy);

        // The displaced sell is no longer tracked and gets cancelled
        let remaining: Vec<_> = remotes.into_iter().filter(|r| r.order_id != top).collect();
        let actions = ledger.reconcile(&snapshot(remaining, 0.0));
        assert_eq!(actions, vec![Action::Cancel { order_id: old_sell }]);
    }

    #[test]
    fn test_long_only_sell_mirror_is_reduce_only() {
        let mut ledger = ledger_at(GridMode::LongOnly, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        accept_all(&mut ledger, &actions);

        let oid = ledger.order_at(1).unwrap().exchange_order_id.clone().unwrap();
        match ledger.apply_fill(&oid, 1.0, 105.0) {
            FillOutcome::Filled {
                mirror: Some(Action::Place {
                    side, reduce_only, ..
                }),
            } => {
                assert_eq!(side, OrderSide::Sell);
                assert!(reduce_only);
            }
            other => panic!("expected reduce-only sell, got {:?}", other),
        }
    }

    #[test]
    fn test_short_only_never_opens_long() {
        // Account starts long 2; after a 1-unit sell it is still long, so a
        // reduce-only buy mirror has no short to close
        let mut ledger = ledger_at(GridMode::ShortOnly, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 2.0));
        accept_all(&mut ledger, &actions);

        let oid = ledger.order_at(3).unwrap().exchange_order_id.clone().unwrap();
        assert_eq!(
            ledger.apply_fill(&oid, 1.0, 115.0),
            FillOutcome::Filled { mirror: None }
        );
    }

    #[test]
    fn test_position_limit_withholds_far_levels() {
        let config = GridConfig::new("SOL_USDC_PERP", 100.0, 120.0, 5, 1.0, 1.0);
        let ladder = GridLadder::build(&config).unwrap();
        let mut ledger =
            OrderLedger::seed(1, RUN, config, ladder, 111.0, PositionState::default());

        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        let places: Vec<u32> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Place { level_index, .. } => Some(*level_index),
                _ => None,
            })
            .collect();
        // One buy and one sell fit within max_position 1, nearest first
        assert_eq!(places, vec![1, 3]);
    }

    #[test]
    fn test_fill_after_snapshot_counts_against_position_limit() {
        let config = GridConfig::new("SOL_USDC_PERP", 100.0, 120.0, 5, 1.0, 1.0);
        let ladder = GridLadder::build(&config).unwrap();
        let mut ledger =
            OrderLedger::seed(1, RUN, config, ladder, 111.0, PositionState::default());
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        let remotes = accept_all(&mut ledger, &actions);

        // Snapshot fetched while flat, then the level 1 buy fills
        let stale = snapshot(remotes, 0.0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let oid = ledger.order_at(1).unwrap().exchange_order_id.clone().unwrap();
        assert!(matches!(
            ledger.apply_fill(&oid, 1.0, 105.0),
            FillOutcome::Filled { .. }
        ));

        let actions = ledger.reconcile(&stale);
        assert!((ledger.expected_position() - 1.0).abs() < 1e-12);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Place { side: OrderSide::Buy, .. })));

        // A snapshot that already includes the fill replaces the delta
        ledger.reconcile(&snapshot(vec![], 1.0));
        assert!(ledger.fill_deltas.is_empty());
        assert!((ledger.expected_position() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_many_round_trips_keep_state_bounded() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        accept_all(&mut ledger, &actions);
        let first_buy = ledger.order_at(1).unwrap().exchange_order_id.clone().unwrap();

        let mut buy_oid = first_buy.clone();
        for round in 0..200 {
            let FillOutcome::Filled {
                mirror: Some(Action::Place { client_id, .. }),
            } = ledger.apply_fill(&buy_oid, 1.0, 105.0)
            else {
                panic!("expected sell mirror in round {}", round);
            };
            let sell_oid = format!("sell-{}", round);
            assert!(ledger.record_placed(2, &client_id, sell_oid.clone()));

            let FillOutcome::Filled {
                mirror: Some(Action::Place { client_id, .. }),
            } = ledger.apply_fill(&sell_oid, 1.0, 110.0)
            else {
                panic!("expected buy mirror in round {}", round);
            };
            buy_oid = format!("buy-{}", round);
            assert!(ledger.record_placed(1, &client_id, buy_oid.clone()));
        }

        assert_eq!(ledger.apply_fill(&first_buy, 1.0, 105.0), FillOutcome::Ignored);
        assert_eq!(ledger.fill_deltas.len(), 400);
        assert!(ledger.expected_position().abs() < 1e-9);

        ledger.reconcile(&snapshot(vec![], 0.0));
        assert!(ledger.fill_deltas.is_empty());
    }

    #[test]
    fn test_cancel_all_tracked_rearms_levels() {
        let mut ledger = ledger_at(GridMode::Neutral, 111.0);
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        accept_all(&mut ledger, &actions);

        let ids = ledger.cancel_all_tracked();
        assert_eq!(ids.len(), 4);
        assert_eq!(ledger.open_order_count(), 0);

        // Coverage is restored on the next pass
        let actions = ledger.reconcile(&snapshot(vec![], 0.0));
        assert_eq!(actions.iter().filter(|a| a.is_place()).count(), 4);
    }

    #[test]
    fn test_parse_client_id() {
        assert_eq!(parse_client_id("abcd1234-3-17-42"), Some(("abcd1234", 3, 17)));
        assert_eq!(parse_client_id("abcd1234-3-17"), None);
        assert_eq!(parse_client_id("abcd1234-x-17-1"), None);
        assert_eq!(parse_client_id("abcd1234-3-17-1-9"), None);
    }
}
