use std::time::Duration;

use clap::Subcommand;
use exchange_core::{BillDenom, CoinDenom};
use exchange_host::transport::serial_link::LinkEvent;
use tracing::{error, info};

use crate::terminal::Terminal;

#[derive(Subcommand, Debug)]
pub enum InventoryCommands {
    /// Print both snapshots
    Show,
    /// Refill every bin to the default float
    Reset,
}

pub fn inventory(terminal: &Terminal, action: &InventoryCommands) {
    match action {
        InventoryCommands::Show => {
            info!("bill float:");
            for (denom, count) in terminal.bills.snapshot() {
                info!("  {denom}: {count}");
            }
            info!("coin float:");
            for (denom, count) in terminal.coins.snapshot() {
                info!("  {denom}: {count}");
            }
        }
        InventoryCommands::Reset => {
            if let Err(e) = terminal.bills.reset() {
                error!("bill reset failed: {e}");
            }
            if let Err(e) = terminal.coins.reset() {
                error!("coin reset failed: {e}");
            }
        }
    }
}

pub async fn dispense(terminal: &mut Terminal, denom: u32, qty: u32, coins: bool) {
    if coins {
        dispense_coins(terminal, denom, qty).await;
    } else {
        match terminal.orch.bank_mut().dispense(denom, qty).await {
            Ok(()) => match terminal.bills.deduct(denom, qty) {
                Ok(true) => info!("dispensed {qty} x {denom}"),
                Ok(false) => error!("dispensed, but recorded stock was already short"),
                Err(e) => error!("stock bookkeeping failed: {e}"),
            },
            Err(e) => error!("dispense failed: {e}"),
        }
    }
}

async fn dispense_coins(terminal: &Terminal, denom: u32, qty: u32) {
    let Ok(coin) = CoinDenom::try_from(denom) else {
        error!("{denom} is not a coin denomination");
        return;
    };
    let mut events = terminal.link.subscribe();
    if let Err(e) = terminal.link.dispense_coins(coin, qty).await {
        error!("dispense command failed: {e}");
        return;
    }
    let confirmation = async {
        loop {
            match events.recv().await {
                Ok(LinkEvent::DispenseDone { denom: d, qty: q }) if d == denom => return q,
                Ok(_) => {}
                Err(_) => return 0,
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(15), confirmation).await {
        Ok(done) => info!("coin module reported {done} x {denom} dispensed"),
        Err(_) => error!("no completion report for {qty} x {denom}"),
    }
}

pub async fn accept(terminal: &mut Terminal, denom: u32) {
    let Ok(required) = BillDenom::try_from(denom) else {
        error!("{denom} is not a bill denomination");
        return;
    };
    match terminal.orch.acceptor_mut().accept_bill(required).await {
        Ok(outcome) => {
            if outcome.accepted() {
                info!("accepted a {denom}");
            } else {
                info!(
                    "rejected ({}, detected {:?})",
                    outcome.reason(),
                    outcome.detected()
                );
            }
        }
        Err(e) => error!("acceptance failed: {e}"),
    }
}
