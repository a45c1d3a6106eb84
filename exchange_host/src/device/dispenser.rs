//! Per-denomination bill dispensers.
//!
//! A dispenser runs its transport belt continuously and pulses the feeder
//! once per bill, confirming each emission on the output IR sensor with a
//! bounded retry budget. The transport is guard-held so it stops on every
//! exit path.

use std::collections::HashMap;
use std::time::Duration;

use derive_builder::Builder;
use exchange_core::BillDenom;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::hardware::gpio::{IrSensor, Motor, MotorGuard};
use crate::orchestrator::cancel::CancelToken;

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct DispenserTiming {
    /// Transport spin-up before the first feed pulse.
    #[builder(default = "Duration::from_millis(500)")]
    pub spin_up: Duration,
    /// Length of one feeder pulse.
    #[builder(default = "Duration::from_millis(250)")]
    pub feed_pulse: Duration,
    /// Budget for the output sensor to see the bill after a pulse.
    #[builder(default = "Duration::from_millis(1000)")]
    pub ir_poll_budget: Duration,
    #[builder(default = "Duration::from_millis(50)")]
    pub ir_poll_interval: Duration,
    /// Gap between consecutive bills.
    #[builder(default = "Duration::from_millis(500)")]
    pub separation: Duration,
    /// Feed attempts per bill before the batch fails.
    #[builder(default = "5")]
    pub max_attempts: u32,
    #[builder(default = "0.6")]
    pub feeder_speed: f32,
    #[builder(default = "1.0")]
    pub transport_speed: f32,
}

impl Default for DispenserTiming {
    fn default() -> Self {
        DispenserTimingBuilder::default()
            .build()
            .expect("builder defaults are complete")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispenseError {
    /// Bill `index` (1-based) never reached the output sensor. Bills
    /// before it were emitted; the caller rolls back only the remainder.
    #[error("bill {index} not detected after {attempts} attempts")]
    BillNotDetected { index: u32, attempts: u32 },
    /// The user backed out at a bill boundary; bills before `index` were
    /// emitted. Cancellation is never honored mid-pulse.
    #[error("cancelled before bill {index}")]
    Cancelled { index: u32 },
}

impl DispenseError {
    /// How many bills physically left the machine before the failure.
    #[must_use]
    pub fn emitted(&self) -> u32 {
        match self {
            DispenseError::BillNotDetected { index, .. }
            | DispenseError::Cancelled { index } => index - 1,
        }
    }
}

pub struct BillDispenser {
    denom: BillDenom,
    feeder: Box<dyn Motor>,
    transport: Box<dyn Motor>,
    output_ir: Box<dyn IrSensor>,
    timing: DispenserTiming,
}

impl BillDispenser {
    pub fn new(
        denom: BillDenom,
        feeder: Box<dyn Motor>,
        transport: Box<dyn Motor>,
        output_ir: Box<dyn IrSensor>,
        timing: DispenserTiming,
    ) -> Self {
        BillDispenser {
            denom,
            feeder,
            transport,
            output_ir,
            timing,
        }
    }

    #[must_use]
    pub fn denom(&self) -> BillDenom {
        self.denom
    }

    /// Emits `qty` bills, confirming each one on the output sensor.
    ///
    /// The transport motor is stopped before this returns on every path,
    /// including failures and panics.
    pub async fn dispense(&mut self, qty: u32) -> Result<(), DispenseError> {
        self.dispense_with_cancel(qty, None).await
    }

    /// Like [`BillDispenser::dispense`], honoring `cancel` at bill
    /// boundaries only.
    #[instrument(name = "dispense_bills", skip(self, cancel), fields(denom = self.denom.value()))]
    pub async fn dispense_with_cancel(
        &mut self,
        qty: u32,
        cancel: Option<&CancelToken>,
    ) -> Result<(), DispenseError> {
        if qty == 0 {
            return Ok(());
        }
        let timing = self.timing.clone();

        let _transport = MotorGuard::forward(self.transport.as_mut(), timing.transport_speed);
        tokio::time::sleep(timing.spin_up).await;

        for index in 1..=qty {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                info!(index, "cancelled between bills");
                return Err(DispenseError::Cancelled { index });
            }
            let mut detected = false;
            for attempt in 1..=timing.max_attempts {
                {
                    let _feeder =
                        MotorGuard::forward(self.feeder.as_mut(), timing.feeder_speed);
                    tokio::time::sleep(timing.feed_pulse).await;
                }

                let deadline = Instant::now() + timing.ir_poll_budget;
                loop {
                    if self.output_ir.detecting() {
                        detected = true;
                        break;
                    }
                    if Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(timing.ir_poll_interval).await;
                }

                if detected {
                    debug!(index, attempt, "bill confirmed at output");
                    break;
                }
                warn!(index, attempt, "bill not detected, retrying feed");
            }

            if !detected {
                warn!(index, "giving up on bill");
                return Err(DispenseError::BillNotDetected {
                    index,
                    attempts: timing.max_attempts,
                });
            }
            tokio::time::sleep(timing.separation).await;
        }

        info!(qty, "batch dispensed");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BankError {
    #[error("no dispenser registered for denomination {0}")]
    NoDispenser(u32),
    #[error("dispenser {denom}: {error}")]
    Dispense {
        denom: u32,
        #[source]
        error: DispenseError,
    },
}

impl BankError {
    /// Bills that physically left the machine before the failure.
    #[must_use]
    pub fn emitted(&self) -> u32 {
        match self {
            BankError::NoDispenser(_) => 0,
            BankError::Dispense { error, .. } => error.emitted(),
        }
    }
}

/// Registry of the machine's per-denomination dispensers.
#[derive(Default)]
pub struct DispenserBank {
    dispensers: HashMap<u32, BillDispenser>,
}

impl DispenserBank {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dispenser: BillDispenser) {
        let denom = dispenser.denom().value();
        if self.dispensers.insert(denom, dispenser).is_some() {
            warn!(denom, "replacing registered dispenser");
        }
        info!(denom, "dispenser registered");
    }

    #[must_use]
    pub fn contains(&self, denom: u32) -> bool {
        self.dispensers.contains_key(&denom)
    }

    /// Registered denominations, descending.
    #[must_use]
    pub fn denominations(&self) -> Vec<u32> {
        let mut denoms: Vec<u32> = self.dispensers.keys().copied().collect();
        denoms.sort_unstable_by(|a, b| b.cmp(a));
        denoms
    }

    pub async fn dispense(&mut self, denom: u32, qty: u32) -> Result<(), BankError> {
        self.dispense_with_cancel(denom, qty, None).await
    }

    pub async fn dispense_with_cancel(
        &mut self,
        denom: u32,
        qty: u32,
        cancel: Option<&CancelToken>,
    ) -> Result<(), BankError> {
        let dispenser = self
            .dispensers
            .get_mut(&denom)
            .ok_or(BankError::NoDispenser(denom))?;
        dispenser
            .dispense_with_cancel(qty, cancel)
            .await
            .map_err(|error| BankError::Dispense { denom, error })
    }
}
