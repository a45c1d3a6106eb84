//! Change planning: turning an amount into a dispensable breakdown under
//! denomination-selection and stock constraints.
//!
//! Everything here is pure. Callers hand in copies of the live stock; the
//! orchestrator reserves the result against the real inventory afterwards.

use std::collections::BTreeMap;

use crate::breakdown::Breakdown;
use crate::denomination::{BillDenom, CoinDenom};

fn descending(denoms: &[u32]) -> Vec<u32> {
    let mut sorted = denoms.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    sorted
}

fn take(stock: &mut BTreeMap<u32, u32>, denom: u32, count: u32) {
    if let Some(available) = stock.get_mut(&denom) {
        *available -= count;
    }
}

/// Plans a payout of `amount` from the selected denominations against a
/// mutable stock copy.
///
/// With a single selected denomination the plan is greedy on that
/// denomination, then falls back through the strictly smaller entries of
/// `kind_table` (the full denomination table for the kind, descending).
/// With several, one unit of every fitting denomination is taken per pass,
/// which spreads the payout instead of draining the largest bin.
///
/// Returns the plan and the residue that could not be covered.
#[must_use]
pub fn simulate_dispense(
    amount: u32,
    denoms: &[u32],
    kind_table: &[u32],
    stock: &mut BTreeMap<u32, u32>,
) -> (Breakdown, u32) {
    let denoms = descending(denoms);
    let mut breakdown = Breakdown::new();
    let mut remaining = amount;

    if denoms.is_empty() {
        return (breakdown, remaining);
    }

    if let [denom] = denoms.as_slice() {
        let denom = *denom;
        let usable = (remaining / denom).min(stock.get(&denom).copied().unwrap_or(0));
        if usable > 0 {
            breakdown.add(denom, usable);
            remaining -= usable * denom;
            take(stock, denom, usable);
        }

        for &smaller in kind_table.iter().filter(|&&d| d < denom) {
            if remaining == 0 {
                break;
            }
            let usable = (remaining / smaller).min(stock.get(&smaller).copied().unwrap_or(0));
            if usable > 0 {
                breakdown.add(smaller, usable);
                remaining -= usable * smaller;
                take(stock, smaller, usable);
            }
        }
    } else {
        loop {
            let mut progress = false;
            for &denom in &denoms {
                if remaining >= denom && stock.get(&denom).copied().unwrap_or(0) > 0 {
                    breakdown.add(denom, 1);
                    remaining -= denom;
                    take(stock, denom, 1);
                    progress = true;
                }
                if remaining == 0 {
                    break;
                }
            }
            if remaining == 0 || !progress {
                break;
            }
        }
    }

    (breakdown, remaining)
}

fn coin_table() -> Vec<u32> {
    CoinDenom::ALL.iter().map(|d| d.value()).collect()
}

fn bill_table() -> Vec<u32> {
    BillDenom::ALL.iter().map(|d| d.value()).collect()
}

/// Plans an all-coin payout of `amount`.
///
/// An empty selection means auto (every coin denomination). When the amount
/// is exactly 20 and the user picked denominations, the 20-peso coin is
/// dropped from the selection so the machine never hands back the same
/// coin the user is trying to break. A selection that cannot cover the
/// amount is retried in auto mode before giving up.
///
/// Returns an empty breakdown when the amount is zero or undispensable.
#[must_use]
pub fn coins_for_amount(
    amount: u32,
    selected: &[u32],
    coin_stock: &BTreeMap<u32, u32>,
) -> Breakdown {
    if amount == 0 {
        return Breakdown::new();
    }

    let table = coin_table();
    let denoms = if selected.is_empty() {
        table.clone()
    } else if amount == 20 {
        selected.iter().copied().filter(|&d| d != 20).collect()
    } else {
        selected.to_vec()
    };

    let mut stock = coin_stock.clone();
    let (breakdown, remaining) = simulate_dispense(amount, &denoms, &table, &mut stock);
    if remaining == 0 {
        return breakdown;
    }

    let mut stock = coin_stock.clone();
    let (breakdown, remaining) = simulate_dispense(amount, &table, &table, &mut stock);
    if remaining == 0 {
        breakdown
    } else {
        Breakdown::new()
    }
}

/// Plans a bill payout of `amount`, topping up with coins when the bills
/// cannot cover it exactly.
///
/// The coin phase is restricted to denominations strictly smaller than the
/// smallest selected bill so coin change never competes with bill change
/// at the same value. Both breakdowns come back empty when the amount is
/// zero or undispensable under the constraints.
#[must_use]
pub fn bills_for_amount(
    amount: u32,
    selected_bills: &[u32],
    bill_stock: &BTreeMap<u32, u32>,
    coin_stock: &BTreeMap<u32, u32>,
) -> (Breakdown, Breakdown) {
    if amount == 0 {
        return (Breakdown::new(), Breakdown::new());
    }

    let bill_table = bill_table();
    let denoms = if selected_bills.is_empty() {
        bill_table.clone()
    } else {
        selected_bills.to_vec()
    };

    let mut stock = bill_stock.clone();
    let (bills, remaining) = simulate_dispense(amount, &denoms, &bill_table, &mut stock);
    if remaining == 0 {
        return (bills, Breakdown::new());
    }

    let min_bill = denoms.iter().copied().min().unwrap_or(u32::MAX);
    let coin_table = coin_table();
    let coin_denoms: Vec<u32> = coin_table.iter().copied().filter(|&d| d < min_bill).collect();

    let mut stock = coin_stock.clone();
    let (coins, remaining) = simulate_dispense(remaining, &coin_denoms, &coin_table, &mut stock);
    if remaining == 0 {
        (bills, coins)
    } else {
        (Breakdown::new(), Breakdown::new())
    }
}
