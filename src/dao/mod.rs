/// Database model definitions.
pub mod models;
/// Race storage backends and the transactional store contract.
pub mod race_store;
/// Storage abstraction layer for database operations.
pub mod storage;
