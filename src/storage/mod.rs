//! Local persistence for counters, dismissals and snapshots

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::LocalStore;
