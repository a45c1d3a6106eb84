pub mod acceptor;
pub mod coin_session;
pub mod dispenser;
