pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use memory::MemoryLedgerStore;
pub use repository::LedgerRepository;
pub use store::{AuditCursor, AuditFilter, LedgerStore, LedgerUnit};
