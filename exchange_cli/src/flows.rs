use exchange_host::orchestrator::{
    CancelToken, FeeMode, FlowError, TransactionReceipt,
};
use tracing::{error, info};

use crate::terminal::Terminal;

pub async fn coin_to_bill(terminal: &mut Terminal, amount: u32, denoms: &[u32]) {
    let cancel = CancelToken::new();
    report(terminal.orch.coin_to_bill(amount, denoms, &cancel).await);
}

pub async fn bill_to_coin(
    terminal: &mut Terminal,
    amount: u32,
    deduct_fee: bool,
    denoms: &[u32],
) {
    let cancel = CancelToken::new();
    report(
        terminal
            .orch
            .bill_to_coin(amount, fee_mode(deduct_fee), denoms, &cancel)
            .await,
    );
}

pub async fn bill_to_bill(
    terminal: &mut Terminal,
    amount: u32,
    deduct_fee: bool,
    denoms: &[u32],
) {
    let cancel = CancelToken::new();
    report(
        terminal
            .orch
            .bill_to_bill(amount, fee_mode(deduct_fee), denoms, &cancel)
            .await,
    );
}

const fn fee_mode(deduct_fee: bool) -> FeeMode {
    if deduct_fee {
        FeeMode::DeductFromBill
    } else {
        FeeMode::Coins
    }
}

fn report(result: Result<TransactionReceipt, FlowError>) {
    match result {
        Ok(receipt) => {
            info!("transaction complete");
            info!(
                "  inserted: {} (bill {} + coins {})",
                receipt.total_inserted(),
                receipt.inserted_bill,
                receipt.inserted_coins
            );
            info!("  fee: {} ({:?})", receipt.fee, receipt.fee_mode);
            info!(
                "  dispensed: {} (bills: {}, coins: {})",
                receipt.dispensed_amount, receipt.bills, receipt.coins
            );
        }
        Err(e) => error!("transaction failed: {e}"),
    }
}
