pub mod explorer;
pub mod multi_chain;
pub mod registry;
pub mod retry;
pub mod scanner;

pub use explorer::{ExplorerError, ExplorerInterface, ExplorerResult, ProviderRoutes};
pub use multi_chain::{MultiChainExplorer, TxDirection};
pub use registry::build_explorer;
pub use retry::{Backoff, RetryPolicy};
pub use scanner::{
    BlockRangeScanner, ScanError, ScanOutcome, ScanRange, ScanResult, ScannerSettings,
};
