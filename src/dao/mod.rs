/// Session snapshot persistence.
pub mod snapshot_store;
/// Storage error types shared by snapshot backends.
pub mod storage;
