use exchange_core::Breakdown;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowKind {
    CoinToBill,
    BillToCoin,
    BillToBill,
}

/// How the service fee is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeeMode {
    /// The user inserts coins covering the fee (C2B bundles it into the
    /// required total).
    Coins,
    /// The fee is subtracted from the value of the inserted bill.
    DeductFromBill,
}

/// Summary of a completed transaction, as shown on the final screen.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionReceipt {
    pub flow: FlowKind,
    pub selected_amount: u32,
    pub fee: u32,
    /// The mode the fee was actually collected in; a coin shortfall on a
    /// bill flow falls back to [`FeeMode::DeductFromBill`].
    pub fee_mode: FeeMode,
    pub inserted_bill: u32,
    pub inserted_coins: u32,
    pub dispensed_amount: u32,
    pub bills: Breakdown,
    pub coins: Breakdown,
}

impl TransactionReceipt {
    #[must_use]
    pub fn total_inserted(&self) -> u32 {
        self.inserted_bill + self.inserted_coins
    }

    /// The plans must add up to the promised amount.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.bills.total() + self.coins.total() == self.dispensed_amount
    }
}
