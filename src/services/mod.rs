pub mod admission;
pub mod breaker;
pub mod encryption;
pub mod executor;
pub mod images;
pub mod inference;
pub mod job_store;
pub mod ledger;
pub mod pool;
pub mod residency;
pub mod storage;
pub mod sweeper;
