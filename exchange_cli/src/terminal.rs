//! Boot wiring for the operator terminal.
//!
//! A real deployment plugs GPIO-backed implementations of the motor, IR
//! and LED capabilities in here. This build ships without a GPIO backend,
//! so boot always enters the degraded mode: primitives mock-pass, nothing
//! physical moves, and the serial link still talks to the bridge socket.

use std::path::Path;

use exchange_core::BillDenom;
use exchange_host::device::acceptor::{AcceptorTiming, BillAcceptor};
use exchange_host::device::dispenser::{BillDispenser, DispenserBank, DispenserTiming};
use exchange_host::hardware::classifier::ScriptedClassifier;
use exchange_host::hardware::gpio::{MockLed, MockMotor, ScriptedIr};
use exchange_host::inventory::{Inventory, InventoryError, InventoryKind};
use exchange_host::orchestrator::Orchestrator;
use exchange_host::transport::serial_link::{LinkConfigBuilder, SerialLink};
use tracing::warn;

pub type KioskOrchestrator = Orchestrator<ScriptedClassifier>;

pub struct Terminal {
    pub orch: KioskOrchestrator,
    pub link: SerialLink,
    pub bills: Inventory,
    pub coins: Inventory,
}

/// Opens the inventories, brings the serial link up and assembles the
/// orchestrator. `classifier_denom` is the label the mocked classifier
/// reports, so bill flows can be exercised end to end without a camera.
pub async fn boot(
    port: &str,
    data_dir: &str,
    classifier_denom: u32,
) -> Result<Terminal, InventoryError> {
    let data_dir = Path::new(data_dir);
    std::fs::create_dir_all(data_dir)?;
    let bills = Inventory::open(data_dir.join("bill_storage.json"), InventoryKind::Bills)?;
    let coins = Inventory::open(data_dir.join("coin_storage.json"), InventoryKind::Coins)?;

    let config = LinkConfigBuilder::default()
        .socket_path(port)
        .build()
        .expect("builder defaults are complete");
    let (link, task) = SerialLink::channel(config, coins.clone());
    tokio::spawn(task.run());

    warn!("no GPIO backend in this build: degraded mode, primitives mock-pass");

    let acceptor = BillAcceptor::new(
        Box::new(MockMotor::new()),
        Box::new(MockLed::new()),
        Box::new(ScriptedIr::always(true)),
        ScriptedClassifier::passing(classifier_denom),
        link.clone(),
        bills.clone(),
        AcceptorTiming::default(),
    );

    let mut bank = DispenserBank::new();
    for denom in BillDenom::ALL {
        bank.register(BillDispenser::new(
            denom,
            Box::new(MockMotor::new()),
            Box::new(MockMotor::new()),
            Box::new(ScriptedIr::always(true)),
            DispenserTiming::default(),
        ));
    }

    let orch = Orchestrator::new(acceptor, bank, link.clone(), bills.clone(), coins.clone());
    Ok(Terminal {
        orch,
        link,
        bills,
        coins,
    })
}
