use std::time::Duration;

use clap::Parser;
use exchange_cli::{Cli, Commands, flows, maintenance, terminal};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt()
        .pretty()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("tracing subscriber should work");

    let cli = Cli::parse();

    // The mocked classifier reads whatever denomination the command is
    // about, so bill flows run end to end without a camera.
    let classifier_denom = match &cli.command {
        Commands::BillToCoin { amount, .. } | Commands::BillToBill { amount, .. } => *amount,
        Commands::Accept { denom } => *denom,
        _ => 0,
    };

    let mut terminal = match terminal::boot(&cli.port, &cli.data_dir, classifier_denom).await {
        Ok(terminal) => terminal,
        Err(e) => {
            error!("boot failed: {e}");
            return;
        }
    };
    info!(port = %cli.port, data_dir = %cli.data_dir, "terminal ready");

    match &cli.command {
        Commands::CoinToBill { amount, denoms } => {
            flows::coin_to_bill(&mut terminal, *amount, denoms).await;
        }
        Commands::BillToCoin {
            amount,
            deduct_fee,
            denoms,
        } => {
            flows::bill_to_coin(&mut terminal, *amount, *deduct_fee, denoms).await;
        }
        Commands::BillToBill {
            amount,
            deduct_fee,
            denoms,
        } => {
            flows::bill_to_bill(&mut terminal, *amount, *deduct_fee, denoms).await;
        }
        Commands::Inventory { action } => maintenance::inventory(&terminal, action),
        Commands::Dispense { denom, qty, coins } => {
            maintenance::dispense(&mut terminal, *denom, *qty, *coins).await;
        }
        Commands::Accept { denom } => maintenance::accept(&mut terminal, *denom).await,
    }

    terminal.link.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
}
