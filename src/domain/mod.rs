pub mod amount;
pub mod balance;
pub mod chain;
pub mod transfer;

pub use amount::AmountError;
pub use balance::BalanceRecord;
pub use chain::{AddressFormat, ChainSpec};
pub use transfer::{
    aggregate_transfers, Transaction, TransferKey, TransferMap, TransferMaps, TransferTx, TxDetails,
};
