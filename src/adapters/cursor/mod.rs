pub mod file;
pub mod memory;

pub use file::JsonFileCursorStore;
pub use memory::MemoryCursorStore;
