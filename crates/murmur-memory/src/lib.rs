pub mod in_memory;
pub mod migrations;
pub mod sqlite_store;
pub mod store;

pub use in_memory::*;
pub use sqlite_store::*;
pub use store::*;
