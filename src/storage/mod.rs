//! Persistent vector storage.
//!
//! [`VectorStore`] keeps the dataset in memory, logs every mutation to a
//! checksummed write-ahead log, and periodically compacts the log into a
//! snapshot. Backups are complete store directories.

mod backup;
mod log;
mod store;

pub use backup::{BACKUP_PREFIX, prune_backups, timestamped_backup_name};
pub use log::Durability;
pub use store::{StorageOptions, StoreSnapshot, StoreStatistics, VectorStore};
