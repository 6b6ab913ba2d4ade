//! Cluster-based key/value filesystem for raw block-addressable media
//! such as EEPROM, NOR/NAND flash and battery-backed RAM.
//!
//! Named blobs are stored in fixed-size clusters and addressed by short
//! string identifiers. The medium's linear layout:
//!
//! - superblock (geometry and liveness counters, CRC protected)
//! - directory entry records
//! - cluster-list slots, one per directory entry
//! - data clusters
//!
//! The first `sys_clusters` clusters hold everything above the data
//! region and are never handed to blobs. Every blob carries a CRC over
//! its logical bytes, verified on read.
//!
//! Devices plug in through the [`Storage`] trait; simulated EEPROM, flash
//! and SDRAM adapters ship with the crate.

mod crc;
mod error;
mod filesystem;
mod storage;
mod structs;

pub use crc::crc32;
pub use error::Error;
pub use filesystem::{Config, Filesystem, Stats};
pub use storage::{
    self_test, EepromStorage, FlashStorage, SdramStorage, Storage, StorageGeometry, StorageKind,
    ERASED_BYTE,
};
pub use structs::{
    DataEntry, Superblock, CLUSTER_SIZE_MAX, CLUSTER_SIZE_MIN, MAX_CLUSTERS_PER_ENTRY,
    MAX_DATA_ID_LEN,
};
