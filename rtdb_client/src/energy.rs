//! [`EnergyBudget`]: reservation/consumption accounting for reducer calls
//! (spec §3/§4.9), grounded on the reservation/spend/release shape implied
//! by `EnergyQuanta` in the message codec and the general budget-manager
//! contract spec §4.9 lays out directly (no single Python module owns this
//! end-to-end; the closest analogue is the credit-accounting style of
//! `connection_pool.py`'s health/metrics bookkeeping, generalized here to a
//! capacity/reserved/spent ledger).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{BudgetError, Result};
use crate::time::Timestamp;

/// Smoothing factor for the cost-estimator calibration loop (spec §4.9,
/// §9 open question #2 -- resolved in `DESIGN.md`): each observed cost
/// nudges the per-byte estimate toward `observed / args_len` by this much.
const CALIBRATION_ALPHA: f64 = 0.2;

/// A reducer call's worth-of-energy estimate before it is sent, spec §4.9
/// ("cost estimate based on reducer name and argument size").
#[derive(Debug, Clone, Copy)]
pub struct CostEstimate {
    pub amount: i64,
}

/// Estimates reducer call cost as `base_cost + args_len * per_byte_cost`,
/// with `per_byte_cost` calibrated from observed costs over time.
#[derive(Debug)]
pub struct CostEstimator {
    base_cost: i64,
    per_byte_cost_bits: AtomicU64, // f64 bit pattern, calibrated online
}

impl CostEstimator {
    pub fn new(base_cost: i64, initial_per_byte_cost: f64) -> Self {
        Self { base_cost, per_byte_cost_bits: AtomicU64::new(initial_per_byte_cost.to_bits()) }
    }

    fn per_byte_cost(&self) -> f64 {
        f64::from_bits(self.per_byte_cost_bits.load(Ordering::Relaxed))
    }

    pub fn estimate(&self, args_len: usize) -> CostEstimate {
        let amount = self.base_cost + (args_len as f64 * self.per_byte_cost()) as i64;
        CostEstimate { amount: amount.max(0) }
    }

    /// Calibration feedback: nudge `per_byte_cost` toward the ratio implied
    /// by `observed_cost` for a call with `args_len` bytes of arguments.
    pub fn calibrate(&self, args_len: usize, observed_cost: i64) {
        let target = observed_cost as f64 / (args_len.max(1) as f64);
        let current = self.per_byte_cost();
        let updated = current + CALIBRATION_ALPHA * (target - current);
        self.per_byte_cost_bits.store(updated.max(0.0).to_bits(), Ordering::Relaxed);
    }
}

/// A notable change in budget state, spec §4.9's event list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetEvent {
    Low,
    Exhausted,
    Refilled,
}

#[derive(Debug, Default)]
struct AnalyticsBucket {
    calls: u64,
    total_cost: i64,
    max_cost: i64,
}

/// Budget reservation/consumption ledger, spec §3/§4.9.
///
/// Invariant (spec §8 property 8): `reserved + spent <= capacity` at all
/// times.
pub struct EnergyBudget {
    capacity: i64,
    period: crate::time::Duration,
    state: Mutex<BudgetState>,
    estimator: CostEstimator,
    listener: Mutex<Option<Box<dyn Fn(BudgetEvent) + Send + Sync>>>,
}

struct BudgetState {
    reserved: i64,
    spent: i64,
    reservations: HashMap<u64, i64>,
    period_start: Timestamp,
    analytics: HashMap<String, AnalyticsBucket>,
    last_event: Option<BudgetEvent>,
}

impl EnergyBudget {
    pub fn new(capacity: i64, period: crate::time::Duration, now: Timestamp) -> Self {
        Self {
            capacity,
            period,
            state: Mutex::new(BudgetState {
                reserved: 0,
                spent: 0,
                reservations: HashMap::new(),
                period_start: now,
                analytics: HashMap::new(),
                last_event: None,
            }),
            estimator: CostEstimator::new(10, 0.01),
            listener: Mutex::new(None),
        }
    }

    /// Registers a callback invoked whenever a [`BudgetEvent`] fires
    /// (`low`/`exhausted`/`refilled`, spec §4.9). Replaces any previous
    /// listener.
    pub fn set_listener(&self, listener: impl Fn(BudgetEvent) + Send + Sync + 'static) {
        *self.listener.lock().unwrap() = Some(Box::new(listener));
    }

    fn notify(&self, event: BudgetEvent) {
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(event);
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn current(&self) -> i64 {
        let state = self.state.lock().unwrap();
        self.capacity - state.reserved - state.spent
    }

    pub fn estimate_cost(&self, args_len: usize) -> CostEstimate {
        self.estimator.estimate(args_len)
    }

    /// Reserves `amount` energy under `op_id`, failing if it would exceed
    /// capacity. `force` bypasses the check (spec §4.9's emergency escape
    /// hatch) but still records the reservation for accounting.
    pub fn reserve(&self, op_id: u64, amount: i64, force: bool) -> Result<BudgetReservation<'_>> {
        let mut state = self.state.lock().unwrap();
        if !force && state.spent + state.reserved + amount > self.capacity {
            return Err(BudgetError::Exhausted {
                required: amount,
                available: self.capacity - state.spent - state.reserved,
            }
            .into());
        }
        state.reserved += amount;
        state.reservations.insert(op_id, amount);
        drop(state);
        if let Some(event) = self.maybe_emit_event() {
            self.notify(event);
        }
        Ok(BudgetReservation { budget: self, op_id })
    }

    /// Moves a reservation from `reserved` to `spent`, recording `op_name`'s
    /// observed cost in the analytics table and feeding the calibration
    /// loop. A reservation that no longer exists is consumed at face value
    /// with no reserved->spent transfer (e.g. a `force=true` call that never
    /// reserved).
    pub fn consume(&self, op_id: u64, op_name: &str, amount: i64) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(reserved_amount) = state.reservations.remove(&op_id) {
                state.reserved -= reserved_amount;
            }
            state.spent += amount;
            let bucket = state.analytics.entry(op_name.to_string()).or_default();
            bucket.calls += 1;
            bucket.total_cost += amount;
            bucket.max_cost = bucket.max_cost.max(amount);
        }
        self.estimator.calibrate(op_name.len().max(1), amount);
        if let Some(event) = self.maybe_emit_event() {
            self.notify(event);
        }
    }

    /// Cancels a reservation; a no-op if `op_id` is unknown (spec §8
    /// property 8: "`release` of a non-existent reservation is a no-op").
    pub fn release(&self, op_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(amount) = state.reservations.remove(&op_id) {
            state.reserved -= amount;
        }
    }

    /// Rolls the accounting period over, resetting `spent` to zero and
    /// emitting a `Refilled` event.
    pub fn rollover(&self, now: Timestamp) -> Option<BudgetEvent> {
        let mut state = self.state.lock().unwrap();
        if now.checked_sub_timestamp(state.period_start) < self.period {
            return None;
        }
        state.spent = 0;
        state.period_start = now;
        state.last_event = Some(BudgetEvent::Refilled);
        drop(state);
        self.notify(BudgetEvent::Refilled);
        Some(BudgetEvent::Refilled)
    }

    fn maybe_emit_event(&self) -> Option<BudgetEvent> {
        let mut state = self.state.lock().unwrap();
        let current = self.capacity - state.reserved - state.spent;
        let event = if current <= 0 {
            Some(BudgetEvent::Exhausted)
        } else if (current as f64) / (self.capacity.max(1) as f64) < 0.2 {
            Some(BudgetEvent::Low)
        } else {
            None
        };
        if event != state.last_event {
            state.last_event = event;
            event
        } else {
            None
        }
    }

    pub fn analytics_for(&self, op_name: &str) -> Option<(u64, i64, i64)> {
        let state = self.state.lock().unwrap();
        state.analytics.get(op_name).map(|b| (b.calls, b.total_cost, b.max_cost))
    }
}

/// A handle to one outstanding reservation. Dropping it does *not* release
/// the reservation -- callers that fire-and-forget a reducer call (spec
/// §4.9's async dispatch) drop this immediately after `reserve` and rely on
/// the eventual `TransactionUpdate`'s [`EnergyBudget::consume`] (or a
/// tracker timeout calling [`EnergyBudget::release`]) to clear it. Call
/// [`BudgetReservation::release`] explicitly to cancel a reservation that
/// will never be consumed.
pub struct BudgetReservation<'a> {
    budget: &'a EnergyBudget,
    op_id: u64,
}

impl BudgetReservation<'_> {
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn release(self) {
        self.budget.release(self.op_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn budget() -> EnergyBudget {
        EnergyBudget::new(1000, crate::time::Duration::from_secs(60), Timestamp::from_micros(0))
    }

    #[test]
    fn reserve_fails_once_capacity_exhausted() {
        let b = budget();
        assert!(b.reserve(1, 600, false).is_ok());
        assert!(b.reserve(2, 500, false).is_err());
    }

    #[test]
    fn reserve_plus_spent_never_exceeds_capacity() {
        let b = budget();
        let r = b.reserve(1, 400, false).unwrap();
        b.consume(r.op_id(), "my_reducer", 400);
        assert!(b.reserve(2, 700, false).is_ok());
    }

    #[test]
    fn low_event_fires_once_below_twenty_percent() {
        let b = budget();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        b.set_listener(move |e| events_clone.lock().unwrap().push(e));
        let _ = b.reserve(1, 850, false).unwrap();
        assert_eq!(*events.lock().unwrap(), vec![BudgetEvent::Low]);
        // Reserving further while still low does not repeat the event.
        let _ = b.reserve(2, 50, false).unwrap();
        assert_eq!(*events.lock().unwrap(), vec![BudgetEvent::Low]);
    }

    #[test]
    fn release_of_unknown_reservation_is_noop() {
        let b = budget();
        b.release(999);
        assert_eq!(b.current(), 1000);
    }

    #[test]
    fn force_bypasses_exhaustion_check() {
        let b = budget();
        assert!(b.reserve(1, 2000, true).is_ok());
    }

    #[test]
    fn calibration_nudges_estimator_toward_observed_cost() {
        let b = budget();
        let before = b.estimate_cost(100).amount;
        let r = b.reserve(1, before, false).unwrap();
        b.consume(r.op_id(), "op", before * 5);
        let after = b.estimate_cost(100).amount;
        assert!(after > before);
    }
}
