//! Tokio runtime for the currency exchange kiosk.
//!
//! The crate wires the pure model from `exchange_core` to hardware: a
//! line-framed serial link to the coin/sorter microcontroller, persisted
//! denomination inventories, the bill acceptance pipeline, per-denomination
//! bill dispensers, coin sessions and the transaction orchestrator on top.

pub mod device;
pub mod hardware;
pub mod inventory;
pub mod orchestrator;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_rig;
