pub mod cursor_store;
pub mod provider;

pub use cursor_store::{cursor_key, CursorStore, CursorStoreError};
pub use provider::{
    decode, OperationKind, ProviderClient, ProviderEntry, ProviderError, ProviderResult,
    RawPayload, ResponseParser, DEFAULT_FANOUT,
};
