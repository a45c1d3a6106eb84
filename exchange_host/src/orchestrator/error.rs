use exchange_core::Breakdown;
use thiserror::Error;

use crate::device::acceptor::{AcceptorError, RejectReason};
use crate::device::dispenser::BankError;
use crate::inventory::InventoryError;
use crate::transport::serial_link::LinkError;

/// Why a transaction flow did not complete. The UI maps these to screens;
/// variants carrying a `refunded` breakdown already paid the user back.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("amount {0} is not offered for this flow")]
    UnsupportedAmount(u32),

    /// No output denomination clears the stock safety threshold; the flow
    /// refuses to start before any money is taken.
    #[error("no denomination is stocked well enough to start a transaction")]
    NoDispensableStock,

    /// The coin session ended below the required total; the inserted
    /// coins were paid back from the captured session counts.
    #[error("coin entry ended at {inserted} below the requirement; coins refunded")]
    CoinTimeout { inserted: u32, refunded: Breakdown },

    #[error("cancelled by the user")]
    Cancelled { refunded: Breakdown },

    /// Planning or reservation could not cover the amount.
    #[error("cannot dispense {amount} with current stock")]
    InsufficientStock { amount: u32, refunded: Breakdown },

    #[error("bill rejected: {reason}")]
    BillRejected {
        detected: Option<u32>,
        reason: RejectReason,
    },

    /// A bill dispenser gave up mid-batch. Remaining reservations were
    /// rolled back; already-emitted bills are not reversible.
    #[error("bill dispense failed: {source}")]
    BillDispense {
        #[from]
        source: BankError,
    },

    /// The coin module never confirmed a payout command.
    #[error("coin dispense of {qty} x {denom} was not confirmed")]
    CoinDispenseTimeout { denom: u32, qty: u32 },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl From<AcceptorError> for FlowError {
    fn from(error: AcceptorError) -> Self {
        match error {
            AcceptorError::Inventory(e) => FlowError::Inventory(e),
        }
    }
}
