//! Data model and wire protocol for the currency exchange kiosk.
//!
//! This crate is free of I/O: denominations, line-framed microcontroller
//! messages, dispense breakdowns, change planning and fee schedules all
//! live here so the runtime crates can stay thin.

mod breakdown;
mod change;
mod denomination;
mod fees;
mod message;

pub use breakdown::Breakdown;
pub use denomination::{BillDenom, CoinDenom, DenomError};
pub use fees::FeeSchedule;
pub use message::{HostCommand, McuMessage, ParseError};

pub mod kiosk {
    pub use crate::breakdown::*;
    pub use crate::change::*;
    pub use crate::denomination::*;
    pub use crate::fees::*;
    pub use crate::message::*;
}
