use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::device::acceptor::{AcceptorTimingBuilder, RejectReason};
use crate::device::dispenser::{BillDispenser, DispenserTimingBuilder};
use crate::hardware::classifier::ScriptedClassifier;
use crate::hardware::gpio::{MockLed, MockMotor, ScriptedIr};
use crate::test_rig::{McuBehavior, McuSim, temp_socket};
use crate::transport::serial_link::LinkConfigBuilder;

struct Rig {
    orch: Orchestrator<ScriptedClassifier>,
    mcu: McuSim,
    bills: Inventory,
    coins: Inventory,
    link: SerialLink,
    _dirs: (TempDir, TempDir),
}

fn write_stock(path: &Path, entries: &[(u32, u32)]) {
    let map: BTreeMap<u32, u32> = entries.iter().copied().collect();
    std::fs::write(path, serde_json::to_vec(&map).expect("json")).expect("write");
}

fn bill_denom(value: u32) -> BillDenom {
    BillDenom::try_from(value).expect("denom")
}

struct RigOptions<'a> {
    bill_stock: &'a [(u32, u32)],
    coin_stock: &'a [(u32, u32)],
    dispensers: &'a [u32],
    accepted_denom: u32,
    dispensers_jam: bool,
}

async fn rig(opts: RigOptions<'_>) -> Rig {
    let (socket_dir, path) = temp_socket();
    let mcu = McuSim::spawn(&path, McuBehavior::default());

    let inv_dir = TempDir::new().expect("tempdir");
    let bills_path = inv_dir.path().join("bills.json");
    let coins_path = inv_dir.path().join("coins.json");
    write_stock(&bills_path, opts.bill_stock);
    write_stock(&coins_path, opts.coin_stock);
    let bills = Inventory::open(&bills_path, crate::inventory::InventoryKind::Bills)
        .expect("bills");
    let coins = Inventory::open(&coins_path, crate::inventory::InventoryKind::Coins)
        .expect("coins");

    let config = LinkConfigBuilder::default()
        .socket_path(path)
        .ack_timeout(Duration::from_millis(500))
        .sort_timeout(Duration::from_millis(500))
        .build()
        .expect("config");
    let (link, task) = SerialLink::channel(config, coins.clone());
    tokio::spawn(task.run());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let acceptor_timing = AcceptorTimingBuilder::default()
        .feed(Duration::from_millis(2))
        .reverse(Duration::from_millis(2))
        .push(Duration::from_millis(2))
        .ir_wait(Duration::from_millis(100))
        .ir_poll(Duration::from_millis(2))
        .build()
        .expect("timing");
    let acceptor = BillAcceptor::new(
        Box::new(MockMotor::new()),
        Box::new(MockLed::new()),
        Box::new(ScriptedIr::always(true)),
        ScriptedClassifier::passing(opts.accepted_denom),
        link.clone(),
        bills.clone(),
        acceptor_timing,
    );

    let dispenser_timing = DispenserTimingBuilder::default()
        .spin_up(Duration::from_millis(2))
        .feed_pulse(Duration::from_millis(2))
        .ir_poll_budget(Duration::from_millis(10))
        .ir_poll_interval(Duration::from_millis(2))
        .separation(Duration::from_millis(2))
        .build()
        .expect("timing");
    let mut bank = DispenserBank::new();
    for &denom in opts.dispensers {
        bank.register(BillDispenser::new(
            bill_denom(denom),
            Box::new(MockMotor::new()),
            Box::new(MockMotor::new()),
            Box::new(ScriptedIr::always(!opts.dispensers_jam)),
            dispenser_timing.clone(),
        ));
    }

    let orch = Orchestrator::new(acceptor, bank, link.clone(), bills.clone(), coins.clone())
        .with_timing(
            OrchestratorTimingBuilder::default()
                .coin_idle_timeout(Duration::from_millis(250))
                .dispense_done_timeout(Duration::from_secs(2))
                .coin_command_gap(Duration::from_millis(5))
                .build()
                .expect("timing"),
        );

    Rig {
        orch,
        mcu,
        bills,
        coins,
        link,
        _dirs: (socket_dir, inv_dir),
    }
}

#[tokio::test]
async fn coin_to_bill_happy_path() {
    let Rig {
        mut orch,
        mcu,
        bills,
        link,
        _dirs,
        ..
    } = rig(RigOptions {
        bill_stock: &[(20, 10), (50, 10), (100, 10)],
        coin_stock: &[(1, 50), (5, 50), (10, 50), (20, 50)],
        dispensers: &[20, 50, 100],
        accepted_denom: 0,
        dispensers_jam: false,
    })
    .await;

    let cancel = CancelToken::new();
    let driver = async {
        mcu.wait_for("ENABLE_COIN").await;
        for _ in 0..4 {
            mcu.push_coin(10);
        }
        mcu.push_coin(5);
    };
    let (result, ()) = tokio::join!(orch.coin_to_bill(40, &[], &cancel), driver);

    let receipt = result.expect("transaction");
    assert_eq!(receipt.fee, 3);
    assert_eq!(receipt.inserted_coins, 45);
    assert_eq!(receipt.dispensed_amount, 42);
    assert!(receipt.is_balanced());
    assert_eq!(receipt.bills.count(20), 2);
    assert_eq!(receipt.coins.total(), 2);

    // Two 20s left the reserved stock for good.
    assert_eq!(bills.count(20), 8);
    link.shutdown();
}

#[tokio::test]
async fn coin_to_bill_refunds_on_timeout() {
    let Rig {
        mut orch,
        mcu,
        bills,
        coins,
        link,
        _dirs,
    } = rig(RigOptions {
        bill_stock: &[(20, 10), (50, 10), (100, 10)],
        coin_stock: &[(1, 50), (5, 50), (10, 50), (20, 50)],
        dispensers: &[20, 50, 100],
        accepted_denom: 0,
        dispensers_jam: false,
    })
    .await;
    let bills_before = bills.snapshot();
    let coins_before = coins.snapshot();

    let cancel = CancelToken::new();
    let driver = async {
        mcu.wait_for("ENABLE_COIN").await;
        for _ in 0..3 {
            mcu.push_coin(10);
        }
        // Then silence until the idle window expires.
    };
    let (result, ()) = tokio::join!(orch.coin_to_bill(100, &[], &cancel), driver);

    match result {
        Err(FlowError::CoinTimeout { inserted, refunded }) => {
            assert_eq!(inserted, 30);
            assert_eq!(refunded.total(), 30);
            assert_eq!(refunded.count(10), 3);
        }
        other => panic!("expected refund, got {other:?}"),
    }

    // The captured session counts drove the refund command.
    mcu.wait_for("DISPENSE:10:3").await;
    // No bill moved and the coin float is back where it started.
    assert_eq!(bills.snapshot(), bills_before);
    assert_eq!(coins.snapshot(), coins_before);
    link.shutdown();
}

#[tokio::test]
async fn bill_to_coin_with_fee_deducted_from_bill() {
    let Rig {
        mut orch,
        mcu,
        bills,
        coins,
        link,
        _dirs,
    } = rig(RigOptions {
        bill_stock: &[(100, 5)],
        coin_stock: &[(1, 20), (5, 20), (10, 20), (20, 0)],
        dispensers: &[],
        accepted_denom: 100,
        dispensers_jam: false,
    })
    .await;

    let cancel = CancelToken::new();
    let receipt = orch
        .bill_to_coin(100, FeeMode::DeductFromBill, &[], &cancel)
        .await
        .expect("transaction");

    assert_eq!(receipt.fee, 5);
    assert_eq!(receipt.fee_mode, FeeMode::DeductFromBill);
    assert_eq!(receipt.inserted_bill, 100);
    assert_eq!(receipt.inserted_coins, 0);
    assert_eq!(receipt.dispensed_amount, 95);
    assert!(receipt.bills.is_empty());
    assert_eq!(receipt.coins.total(), 95);
    // The empty 20 bin cannot contribute.
    assert_eq!(receipt.coins.count(20), 0);

    // The accepted bill is banked; nothing dispenses bills in this flow.
    assert_eq!(bills.count(100), 6);
    let dispensed_coins: u32 = receipt
        .coins
        .iter_desc()
        .map(|(denom, count)| {
            assert_eq!(coins.count(denom), 20 - count);
            denom * count
        })
        .sum();
    assert_eq!(dispensed_coins, 95);
    drop(mcu);
    link.shutdown();
}

#[tokio::test]
async fn bill_to_bill_coin_shortfall_falls_back_to_deduction() {
    let Rig {
        mut orch,
        mcu,
        bills,
        link,
        _dirs,
        ..
    } = rig(RigOptions {
        bill_stock: &[(50, 10), (100, 10)],
        coin_stock: &[(1, 10), (5, 10), (10, 10)],
        dispensers: &[50, 100],
        accepted_denom: 500,
        dispensers_jam: false,
    })
    .await;

    let cancel = CancelToken::new();
    let driver = async {
        mcu.wait_for("ENABLE_COIN").await;
        mcu.push_coin(5);
        mcu.push_coin(1);
        // Short of the 7-peso fee; the idle window runs out.
    };
    let (result, ()) = tokio::join!(
        orch.bill_to_bill(500, FeeMode::Coins, &[], &cancel),
        driver
    );

    let receipt = result.expect("transaction");
    assert_eq!(receipt.fee, 7);
    assert_eq!(receipt.fee_mode, FeeMode::DeductFromBill);
    assert_eq!(receipt.inserted_bill, 500);
    assert_eq!(receipt.inserted_coins, 6);
    // 500 - 7 + 6
    assert_eq!(receipt.dispensed_amount, 499);
    assert!(receipt.is_balanced());
    assert!(!receipt.bills.is_empty());
    assert!(!receipt.coins.is_empty());
    // Only bills smaller than the inserted one break it.
    assert_eq!(receipt.bills.count(500), 0);

    assert_eq!(bills.count(500), 1);
    assert_eq!(bills.count(100), 10 - receipt.bills.count(100));
    assert_eq!(bills.count(50), 10 - receipt.bills.count(50));
    link.shutdown();
}

#[tokio::test]
async fn refuses_to_start_below_stock_threshold() {
    let Rig {
        mut orch,
        mcu,
        link,
        _dirs,
        ..
    } = rig(RigOptions {
        bill_stock: &[(20, 4), (50, 3), (100, 0)],
        coin_stock: &[(1, 50), (5, 50), (10, 50), (20, 50)],
        dispensers: &[20, 50, 100],
        accepted_denom: 0,
        dispensers_jam: false,
    })
    .await;

    let cancel = CancelToken::new();
    let result = orch.coin_to_bill(40, &[], &cancel).await;
    assert!(matches!(result, Err(FlowError::NoDispensableStock)));
    // Refused before any money was taken.
    assert!(!mcu.received().contains(&"ENABLE_COIN".to_string()));
    link.shutdown();
}

#[tokio::test]
async fn rejected_bill_ends_the_flow() {
    let Rig {
        mut orch,
        bills,
        link,
        _dirs,
        ..
    } = rig(RigOptions {
        bill_stock: &[(100, 5)],
        coin_stock: &[(1, 20), (5, 20), (10, 20), (20, 20)],
        dispensers: &[],
        // The classifier keeps seeing a 50 while a 100 is required.
        accepted_denom: 50,
        dispensers_jam: false,
    })
    .await;
    let before = bills.snapshot();

    let cancel = CancelToken::new();
    let result = orch
        .bill_to_coin(100, FeeMode::DeductFromBill, &[], &cancel)
        .await;
    match result {
        Err(FlowError::BillRejected { detected, reason }) => {
            assert_eq!(detected, Some(50));
            assert_eq!(reason, RejectReason::DenomNotRequired);
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(bills.snapshot(), before);
    link.shutdown();
}

#[tokio::test]
async fn jammed_dispenser_rolls_back_remaining_reservations() {
    let Rig {
        mut orch,
        mcu,
        bills,
        link,
        _dirs,
        ..
    } = rig(RigOptions {
        bill_stock: &[(20, 10), (50, 10), (100, 10)],
        coin_stock: &[(1, 50), (5, 50), (10, 50), (20, 50)],
        dispensers: &[20, 50, 100],
        accepted_denom: 0,
        dispensers_jam: true,
    })
    .await;

    let cancel = CancelToken::new();
    let driver = async {
        mcu.wait_for("ENABLE_COIN").await;
        for _ in 0..4 {
            mcu.push_coin(10);
        }
        mcu.push_coin(5);
    };
    let (result, ()) = tokio::join!(orch.coin_to_bill(40, &[], &cancel), driver);

    match result {
        Err(FlowError::BillDispense { source }) => {
            assert_eq!(source.emitted(), 0);
        }
        other => panic!("expected dispense failure, got {other:?}"),
    }
    // Nothing was emitted, so the whole reservation came back.
    assert_eq!(bills.count(20), 10);
    link.shutdown();
}

#[tokio::test]
async fn cancel_during_coin_entry_refunds() {
    let Rig {
        mut orch,
        mcu,
        coins,
        link,
        _dirs,
        ..
    } = rig(RigOptions {
        bill_stock: &[(20, 10), (50, 10), (100, 10)],
        coin_stock: &[(1, 50), (5, 50), (10, 50), (20, 50)],
        dispensers: &[20, 50, 100],
        accepted_denom: 0,
        dispensers_jam: false,
    })
    .await;
    let coins_before = coins.snapshot();

    let cancel = CancelToken::new();
    let driver = async {
        mcu.wait_for("ENABLE_COIN").await;
        mcu.push_coin(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(orch.coin_to_bill(40, &[], &cancel), driver);

    match result {
        Err(FlowError::Cancelled { refunded }) => {
            assert_eq!(refunded.total(), 10);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    mcu.wait_for("DISPENSE:10:1").await;
    assert_eq!(coins.snapshot(), coins_before);
    link.shutdown();
}

#[tokio::test]
async fn availability_rule_filters_value_and_stock() {
    let Rig {
        orch,
        link,
        _dirs,
        ..
    } = rig(RigOptions {
        bill_stock: &[(20, 10), (50, 4), (100, 10), (200, 10)],
        coin_stock: &[(1, 50), (5, 2), (10, 50), (20, 50)],
        dispensers: &[20, 50, 100],
        accepted_denom: 0,
        dispensers_jam: false,
    })
    .await;

    // 50 is under-stocked, 100 exceeds the amount, 200 has no dispenser.
    assert_eq!(orch.available_bill_denoms(90), vec![20]);
    assert_eq!(orch.available_bill_denoms(150), vec![100, 20]);
    // 5s are under-stocked.
    assert_eq!(orch.available_coin_denoms(15), vec![10, 1]);
    link.shutdown();
}
