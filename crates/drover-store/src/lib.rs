mod db;
mod queue;
mod records;

pub use db::Database;
pub use queue::{LaneSizes, SqliteQueue};
pub use records::SqliteStore;
