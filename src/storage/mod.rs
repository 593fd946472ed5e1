pub mod duckdb;
pub mod traits;

pub use self::duckdb::DuckDbStorage;
pub use traits::{
    ActualEvent, BatchMember, DeletedRows, Equipment, EquipmentFilter, Lot, ReservedBatch,
    StepRecord, Storage, StorageError,
};
