//! Transaction orchestration: the three exchange flows over acceptance,
//! fee collection, change planning, reservation and dispensing.

pub mod cancel;
pub mod error;
pub mod receipt;

use std::time::Duration;

use derive_builder::Builder;
use exchange_core::kiosk::{bills_for_amount, coins_for_amount};
use exchange_core::{BillDenom, Breakdown, CoinDenom, FeeSchedule};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::device::acceptor::{AcceptOutcome, BillAcceptor};
use crate::device::coin_session::{CoinSession, SessionCounters, SessionEvent};
use crate::device::dispenser::{BankError, DispenseError, DispenserBank};
use crate::hardware::classifier::ClassifierPort;
use crate::inventory::Inventory;
use crate::transport::serial_link::{LinkEvent, SerialLink};

pub use cancel::CancelToken;
pub use error::FlowError;
pub use receipt::{FeeMode, FlowKind, TransactionReceipt};

/// A denomination is selectable only while its bin holds at least this
/// many units.
pub const MIN_SELECTABLE_STOCK: u32 = 5;

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct OrchestratorTiming {
    /// Idle window for coin entry; every inserted coin restarts it.
    #[builder(default = "Duration::from_secs(120)")]
    pub coin_idle_timeout: Duration,
    /// Wait per coin dispense command for its completion report.
    #[builder(default = "Duration::from_secs(15)")]
    pub dispense_done_timeout: Duration,
    /// Pause between consecutive coin dispense commands.
    #[builder(default = "Duration::from_secs(1)")]
    pub coin_command_gap: Duration,
}

impl Default for OrchestratorTiming {
    fn default() -> Self {
        OrchestratorTimingBuilder::default()
            .build()
            .expect("builder defaults are complete")
    }
}

enum CoinWait {
    Reached,
    TimedOut,
    Cancelled,
}

/// Drives one customer transaction at a time.
///
/// Owns the acceptor and the dispenser bank outright; everything shared
/// (link, inventories) is held through cloneable handles, so no strong
/// cycles exist between the orchestrator and the components it drives.
pub struct Orchestrator<C> {
    acceptor: BillAcceptor<C>,
    bank: DispenserBank,
    link: SerialLink,
    bills: Inventory,
    coins: Inventory,
    c2b_fees: FeeSchedule,
    b2c_fees: FeeSchedule,
    b2b_fees: FeeSchedule,
    timing: OrchestratorTiming,
}

impl<C: ClassifierPort> Orchestrator<C> {
    pub fn new(
        acceptor: BillAcceptor<C>,
        bank: DispenserBank,
        link: SerialLink,
        bills: Inventory,
        coins: Inventory,
    ) -> Self {
        Orchestrator {
            acceptor,
            bank,
            link,
            bills,
            coins,
            c2b_fees: FeeSchedule::coin_to_bill(),
            b2c_fees: FeeSchedule::bill_to_coin(),
            b2b_fees: FeeSchedule::bill_to_bill(),
            timing: OrchestratorTiming::default(),
        }
    }

    #[must_use]
    pub fn with_timing(mut self, timing: OrchestratorTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Direct access for maintenance tooling (manual dispense runs).
    pub fn bank_mut(&mut self) -> &mut DispenserBank {
        &mut self.bank
    }

    /// Direct access for maintenance tooling (manual acceptance runs).
    pub fn acceptor_mut(&mut self) -> &mut BillAcceptor<C> {
        &mut self.acceptor
    }

    /// Bill denominations the user may choose for an output of `amount`:
    /// worth at most the amount, stocked above the safety threshold, and
    /// backed by a registered dispenser. Descending.
    #[must_use]
    pub fn available_bill_denoms(&self, amount: u32) -> Vec<u32> {
        let stock = self.bills.snapshot();
        BillDenom::ALL
            .iter()
            .map(|d| d.value())
            .filter(|&d| {
                d <= amount
                    && stock.get(&d).copied().unwrap_or(0) >= MIN_SELECTABLE_STOCK
                    && self.bank.contains(d)
            })
            .collect()
    }

    /// Coin denominations the user may choose for an output of `amount`.
    #[must_use]
    pub fn available_coin_denoms(&self, amount: u32) -> Vec<u32> {
        let stock = self.coins.snapshot();
        CoinDenom::ALL
            .iter()
            .map(|d| d.value())
            .filter(|&d| d <= amount && stock.get(&d).copied().unwrap_or(0) >= MIN_SELECTABLE_STOCK)
            .collect()
    }

    /// Converts coins into bills. The fee is bundled into the coin total;
    /// falling short refunds every inserted coin.
    #[instrument(name = "coin_to_bill", skip(self, cancel))]
    pub async fn coin_to_bill(
        &mut self,
        selected_amount: u32,
        selected_bills: &[u32],
        cancel: &CancelToken,
    ) -> Result<TransactionReceipt, FlowError> {
        let fee = self
            .c2b_fees
            .fee_for(selected_amount)
            .ok_or(FlowError::UnsupportedAmount(selected_amount))?;
        if self.available_bill_denoms(selected_amount).is_empty() {
            return Err(FlowError::NoDispensableStock);
        }

        let required = selected_amount + fee;
        info!(fee, required, "collecting coins");
        let (counters, wait) = self.collect_coins(required, cancel).await?;
        let inserted = counters.total();

        if inserted < required {
            warn!(inserted, required, "coin entry fell short, refunding");
            let refunded = self.refund_session_coins(&counters).await;
            return Err(match wait {
                CoinWait::Cancelled => FlowError::Cancelled { refunded },
                _ => FlowError::CoinTimeout { inserted, refunded },
            });
        }

        let amount = selected_amount + (inserted - required);
        let denoms = self.resolve_bill_selection(selected_bills, amount, u32::MAX);
        let (bill_plan, coin_plan) = bills_for_amount(
            amount,
            &denoms,
            &self.bills.snapshot(),
            &self.coins.snapshot(),
        );
        if amount > 0 && bill_plan.is_empty() && coin_plan.is_empty() {
            warn!(amount, "undispensable amount, refunding coins");
            let refunded = self.refund_session_coins(&counters).await;
            return Err(FlowError::InsufficientStock { amount, refunded });
        }
        if !self.bills.reserve(&bill_plan)? {
            let refunded = self.refund_session_coins(&counters).await;
            return Err(FlowError::InsufficientStock { amount, refunded });
        }

        self.dispense_planned_bills(&bill_plan, cancel).await?;
        self.dispense_planned_coins(&coin_plan, Some(cancel)).await?;

        Ok(TransactionReceipt {
            flow: FlowKind::CoinToBill,
            selected_amount,
            fee,
            fee_mode: FeeMode::Coins,
            inserted_bill: 0,
            inserted_coins: inserted,
            dispensed_amount: amount,
            bills: bill_plan,
            coins: coin_plan,
        })
    }

    /// Breaks a bill into coins. The fee comes from inserted coins or, on
    /// request or coin shortfall, out of the bill's value; an accepted
    /// bill is never refunded.
    #[instrument(name = "bill_to_coin", skip(self, cancel))]
    pub async fn bill_to_coin(
        &mut self,
        selected_amount: u32,
        fee_mode: FeeMode,
        selected_coins: &[u32],
        cancel: &CancelToken,
    ) -> Result<TransactionReceipt, FlowError> {
        let fee = self
            .b2c_fees
            .fee_for(selected_amount)
            .ok_or(FlowError::UnsupportedAmount(selected_amount))?;
        if self.available_coin_denoms(selected_amount).is_empty() {
            return Err(FlowError::NoDispensableStock);
        }

        let required = BillDenom::try_from(selected_amount)
            .map_err(|_| FlowError::UnsupportedAmount(selected_amount))?;
        let outcome = self.acceptor.accept_bill(required).await?;
        let AcceptOutcome::Accepted { .. } = outcome else {
            return Err(reject_error(&outcome));
        };

        let (inserted_coins, effective_mode, covered) =
            self.collect_fee(fee, fee_mode, cancel).await?;
        let amount = dispense_amount(selected_amount, fee, inserted_coins, covered);
        info!(amount, inserted_coins, ?effective_mode, "planning coin payout");

        let denoms = self.resolve_coin_selection(selected_coins, amount);
        let plan = coins_for_amount(amount, &denoms, &self.coins.snapshot());
        if amount > 0 && plan.is_empty() {
            return Err(FlowError::InsufficientStock {
                amount,
                refunded: Breakdown::new(),
            });
        }
        self.dispense_planned_coins(&plan, Some(cancel)).await?;

        Ok(TransactionReceipt {
            flow: FlowKind::BillToCoin,
            selected_amount,
            fee,
            fee_mode: effective_mode,
            inserted_bill: selected_amount,
            inserted_coins,
            dispensed_amount: amount,
            bills: Breakdown::new(),
            coins: plan,
        })
    }

    /// Breaks a bill into smaller bills, topping up with coins. Fee rules
    /// match [`Orchestrator::bill_to_coin`].
    #[instrument(name = "bill_to_bill", skip(self, cancel))]
    pub async fn bill_to_bill(
        &mut self,
        selected_amount: u32,
        fee_mode: FeeMode,
        selected_bills: &[u32],
        cancel: &CancelToken,
    ) -> Result<TransactionReceipt, FlowError> {
        let fee = self
            .b2b_fees
            .fee_for(selected_amount)
            .ok_or(FlowError::UnsupportedAmount(selected_amount))?;
        // Only strictly smaller bills can break the inserted one.
        if self
            .available_bill_denoms(selected_amount)
            .iter()
            .all(|&d| d >= selected_amount)
        {
            return Err(FlowError::NoDispensableStock);
        }

        let required = BillDenom::try_from(selected_amount)
            .map_err(|_| FlowError::UnsupportedAmount(selected_amount))?;
        let outcome = self.acceptor.accept_bill(required).await?;
        let AcceptOutcome::Accepted { .. } = outcome else {
            return Err(reject_error(&outcome));
        };

        let (inserted_coins, effective_mode, covered) =
            self.collect_fee(fee, fee_mode, cancel).await?;
        let amount = dispense_amount(selected_amount, fee, inserted_coins, covered);
        info!(amount, inserted_coins, ?effective_mode, "planning bill payout");

        let denoms = self.resolve_bill_selection(selected_bills, amount, selected_amount);
        let (bill_plan, coin_plan) = bills_for_amount(
            amount,
            &denoms,
            &self.bills.snapshot(),
            &self.coins.snapshot(),
        );
        if amount > 0 && bill_plan.is_empty() && coin_plan.is_empty() {
            return Err(FlowError::InsufficientStock {
                amount,
                refunded: Breakdown::new(),
            });
        }
        if !self.bills.reserve(&bill_plan)? {
            return Err(FlowError::InsufficientStock {
                amount,
                refunded: Breakdown::new(),
            });
        }

        self.dispense_planned_bills(&bill_plan, cancel).await?;
        self.dispense_planned_coins(&coin_plan, Some(cancel)).await?;

        Ok(TransactionReceipt {
            flow: FlowKind::BillToBill,
            selected_amount,
            fee,
            fee_mode: effective_mode,
            inserted_bill: selected_amount,
            inserted_coins,
            dispensed_amount: amount,
            bills: bill_plan,
            coins: coin_plan,
        })
    }

    /// Collects the fee in coins when asked to; a shortfall falls back to
    /// deducting from the bill with the inserted coins kept as excess.
    async fn collect_fee(
        &mut self,
        fee: u32,
        fee_mode: FeeMode,
        cancel: &CancelToken,
    ) -> Result<(u32, FeeMode, bool), FlowError> {
        match fee_mode {
            FeeMode::DeductFromBill => Ok((0, FeeMode::DeductFromBill, false)),
            FeeMode::Coins => {
                let (counters, _) = self.collect_coins(fee, cancel).await?;
                let inserted = counters.total();
                if inserted >= fee {
                    Ok((inserted, FeeMode::Coins, true))
                } else {
                    info!(inserted, fee, "fee short, deducting from bill");
                    Ok((inserted, FeeMode::DeductFromBill, false))
                }
            }
        }
    }

    async fn collect_coins(
        &self,
        required: u32,
        cancel: &CancelToken,
    ) -> Result<(SessionCounters, CoinWait), FlowError> {
        let (tx, mut rx) = mpsc::channel(32);
        let session = CoinSession::start(self.link.clone(), required, tx).await?;

        let mut wait = CoinWait::TimedOut;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(SessionEvent::Reached { .. }) => {
                        wait = CoinWait::Reached;
                        break;
                    }
                    // Each coin restarts the idle window by re-entering
                    // the select.
                    Some(SessionEvent::Coin { .. }) => {}
                    None => break,
                },
                () = tokio::time::sleep(self.timing.coin_idle_timeout) => break,
                () = cancel.cancelled() => {
                    wait = CoinWait::Cancelled;
                    break;
                }
            }
        }

        let counters = session.stop().await;
        Ok((counters, wait))
    }

    fn resolve_bill_selection(&self, selected: &[u32], amount: u32, below: u32) -> Vec<u32> {
        let available: Vec<u32> = self
            .available_bill_denoms(amount)
            .into_iter()
            .filter(|&d| d < below)
            .collect();
        resolve_selection(selected, &available)
    }

    fn resolve_coin_selection(&self, selected: &[u32], amount: u32) -> Vec<u32> {
        let available = self.available_coin_denoms(amount);
        resolve_selection(selected, &available)
    }

    /// Dispenses a reserved bill plan, largest denomination first, each
    /// batch to completion. On failure only the remaining reservations
    /// are rolled back.
    async fn dispense_planned_bills(
        &mut self,
        plan: &Breakdown,
        cancel: &CancelToken,
    ) -> Result<(), FlowError> {
        let entries: Vec<(u32, u32)> = plan.iter_desc().collect();
        for (position, &(denom, qty)) in entries.iter().enumerate() {
            debug!(denom, qty, "dispensing bills");
            if let Err(e) = self.bank.dispense_with_cancel(denom, qty, Some(cancel)).await {
                let emitted = e.emitted();
                let mut leftover = Breakdown::new();
                leftover.add(denom, qty - emitted);
                for &(d, q) in &entries[position + 1..] {
                    leftover.add(d, q);
                }
                error!(denom, emitted, %leftover, "bill dispense failed, rolling back remainder");
                self.bills.rollback(&leftover)?;
                return Err(match e {
                    BankError::Dispense {
                        error: DispenseError::Cancelled { .. },
                        ..
                    } => FlowError::Cancelled {
                        refunded: Breakdown::new(),
                    },
                    other => FlowError::BillDispense { source: other },
                });
            }
        }
        Ok(())
    }

    /// Issues one coin dispense command per denomination, awaiting each
    /// completion report before the next. Coin stock is debited by the
    /// link as the firmware confirms.
    async fn dispense_planned_coins(
        &self,
        plan: &Breakdown,
        cancel: Option<&CancelToken>,
    ) -> Result<(), FlowError> {
        if plan.is_empty() {
            return Ok(());
        }
        let mut events = self.link.subscribe();
        for (denom, qty) in plan.iter_desc() {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(FlowError::Cancelled {
                        refunded: Breakdown::new(),
                    });
                }
            }
            let Ok(coin) = CoinDenom::try_from(denom) else {
                warn!(denom, "skipping plan entry with unknown coin");
                continue;
            };
            debug!(denom, qty, "dispensing coins");
            self.link.dispense_coins(coin, qty).await?;
            self.wait_dispense_done(&mut events, denom, qty).await?;
            tokio::time::sleep(self.timing.coin_command_gap).await;
        }
        Ok(())
    }

    async fn wait_dispense_done(
        &self,
        events: &mut broadcast::Receiver<LinkEvent>,
        denom: u32,
        qty: u32,
    ) -> Result<(), FlowError> {
        let confirmation = async {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::DispenseDone { denom: d, qty: q }) if d == denom => {
                        if q != qty {
                            warn!(denom, expected = qty, reported = q, "payout count mismatch");
                        }
                        return true;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "lagged behind link events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        match tokio::time::timeout(self.timing.dispense_done_timeout, confirmation).await {
            Ok(true) => Ok(()),
            _ => Err(FlowError::CoinDispenseTimeout { denom, qty }),
        }
    }

    /// Pays back every coin of a failed session from the captured
    /// per-denomination counts. Best effort: a stuck denomination is
    /// logged and the rest still goes out.
    async fn refund_session_coins(&self, counters: &SessionCounters) -> Breakdown {
        let plan = counters.breakdown();
        if plan.is_empty() {
            return plan;
        }
        info!(total = plan.total(), "refunding inserted coins");
        let mut events = self.link.subscribe();
        for (denom, qty) in plan.iter_desc() {
            let Ok(coin) = CoinDenom::try_from(denom) else {
                continue;
            };
            if let Err(e) = self.link.dispense_coins(coin, qty).await {
                error!(denom, qty, error = %e, "refund command failed");
                continue;
            }
            if let Err(e) = self.wait_dispense_done(&mut events, denom, qty).await {
                error!(denom, qty, error = %e, "refund not confirmed");
            }
            tokio::time::sleep(self.timing.coin_command_gap).await;
        }
        plan
    }
}

fn resolve_selection(selected: &[u32], available: &[u32]) -> Vec<u32> {
    if selected.is_empty() {
        return available.to_vec();
    }
    let chosen: Vec<u32> = selected
        .iter()
        .copied()
        .filter(|d| available.contains(d))
        .collect();
    if chosen.is_empty() {
        available.to_vec()
    } else {
        chosen
    }
}

/// The amount owed to the user. With the fee covered by coins the excess
/// rides on top of the selected amount; otherwise the fee comes out of
/// the bill and any inserted coins ride along.
fn dispense_amount(selected: u32, fee: u32, inserted_coins: u32, fee_covered: bool) -> u32 {
    if fee_covered {
        selected + (inserted_coins - fee)
    } else {
        selected - fee + inserted_coins
    }
}

fn reject_error(outcome: &AcceptOutcome) -> FlowError {
    match outcome {
        AcceptOutcome::Accepted { .. } => unreachable!("only called on rejections"),
        AcceptOutcome::Rejected { detected, reason } => FlowError::BillRejected {
            detected: *detected,
            reason: *reason,
        },
    }
}

#[cfg(test)]
mod tests;
