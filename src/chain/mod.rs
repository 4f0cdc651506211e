//! Chain access: the Bitcoin explorer/wallet side and the EVM contract side.

pub mod btc;
pub mod evm;
