pub mod error;
#[cfg(test)]
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod postgres;
pub mod store;

pub use error::DbError;
pub use pool::DbPool;
pub use postgres::PgScanStore;
pub use store::ScanStore;
