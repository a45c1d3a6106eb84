use clap::{Parser, Subcommand};

pub mod flows;
pub mod maintenance;
pub mod terminal;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Stream socket the microcontroller bridge exposes
    #[arg(short, long, default_value = exchange_host::transport::serial_link::DEFAULT_PORT)]
    pub port: String,

    /// Directory holding the inventory snapshot files
    #[arg(short, long, default_value = "/var/lib/exchange-kiosk")]
    pub data_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert inserted coins into bills
    CoinToBill {
        /// Bill amount to dispense
        amount: u32,

        /// Preferred output denominations (empty = auto)
        #[arg(short = 'n', long, value_delimiter = ',')]
        denoms: Vec<u32>,
    },

    /// Break a bill into coins
    BillToCoin {
        /// Bill denomination to insert
        amount: u32,

        /// Deduct the service fee from the bill instead of asking for coins
        #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
        deduct_fee: bool,

        /// Preferred output denominations (empty = auto)
        #[arg(short = 'n', long, value_delimiter = ',')]
        denoms: Vec<u32>,
    },

    /// Break a bill into smaller bills
    BillToBill {
        /// Bill denomination to insert
        amount: u32,

        /// Deduct the service fee from the bill instead of asking for coins
        #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
        deduct_fee: bool,

        /// Preferred output denominations (empty = auto)
        #[arg(short = 'n', long, value_delimiter = ',')]
        denoms: Vec<u32>,
    },

    /// Inspect or restock the float
    Inventory {
        #[command(subcommand)]
        action: maintenance::InventoryCommands,
    },

    /// Drive one dispenser or the coin module directly
    Dispense {
        denom: u32,

        #[arg(default_value_t = 1)]
        qty: u32,

        /// Dispense coins through the serial module instead of bills
        #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
        coins: bool,
    },

    /// Run one acceptance attempt for the given denomination
    Accept { denom: u32 },
}
