use std::fmt::Display;

use super::*;
use crate::crc::crc32;
use crate::storage::Storage;
use crate::Error;

impl Superblock {
    pub(crate) fn new(cluster_size: u16, total_clusters: u16, sys_clusters: u16) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            cluster_size,
            total_clusters,
            sys_clusters,
            data_entries: 0,
            free_clusters: total_clusters - sys_clusters,
            crc32: 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..6].copy_from_slice(&self.version.to_le_bytes());
        raw[6..8].copy_from_slice(&self.cluster_size.to_le_bytes());
        raw[8..10].copy_from_slice(&self.total_clusters.to_le_bytes());
        raw[10..12].copy_from_slice(&self.sys_clusters.to_le_bytes());
        raw[12..14].copy_from_slice(&self.data_entries.to_le_bytes());
        raw[14..16].copy_from_slice(&self.free_clusters.to_le_bytes());
        raw[16..20].copy_from_slice(&self.crc32.to_le_bytes());
        raw
    }

    pub(crate) fn decode(raw: &[u8; SUPERBLOCK_SIZE]) -> Self {
        Self {
            magic: u32_from_bytes(&raw[0..4]),
            version: u16_from_bytes(&raw[4..6]),
            cluster_size: u16_from_bytes(&raw[6..8]),
            total_clusters: u16_from_bytes(&raw[8..10]),
            sys_clusters: u16_from_bytes(&raw[10..12]),
            data_entries: u16_from_bytes(&raw[12..14]),
            free_clusters: u16_from_bytes(&raw[14..16]),
            crc32: u32_from_bytes(&raw[16..20]),
        }
    }

    /// Recompute the trailing CRC from the current field values.
    pub(crate) fn update_crc(&mut self) {
        let raw = self.encode();
        self.crc32 = crc32(&raw[..SUPERBLOCK_SIZE - 4]);
    }

    pub(crate) fn crc_valid(&self) -> bool {
        let raw = self.encode();
        crc32(&raw[..SUPERBLOCK_SIZE - 4]) == self.crc32
    }

    /// Read and validate the superblock at the head of the medium.
    pub(crate) fn load(device: &mut dyn Storage) -> Result<Self, Error> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        device.read(device.geometry().start_addr, &mut raw)?;
        let superblock = Self::decode(&raw);
        if superblock.magic != MAGIC {
            return Err(Error::InvalidFilesystem);
        }
        if !superblock.crc_valid() {
            return Err(Error::DataCorrupted);
        }
        Ok(superblock)
    }

    /// Seal and write the superblock to the head of the medium.
    pub(crate) fn flush(&mut self, device: &mut dyn Storage) -> Result<(), Error> {
        self.update_crc();
        device.write(device.geometry().start_addr, &self.encode())
    }

    /// Directory capacity: how many entry records plus cluster-list slots
    /// fit in the reserved region after the superblock.
    pub(crate) fn max_entries(&self) -> usize {
        let reserved = self.sys_clusters as usize * self.cluster_size as usize;
        reserved.saturating_sub(SUPERBLOCK_SIZE) / (ENTRY_RECORD_SIZE + CLUSTER_LIST_SLOT_SIZE)
    }

    /// Medium offset of entry record `index`, relative to `start_addr`.
    pub(crate) fn entry_offset(&self, index: usize) -> u32 {
        (SUPERBLOCK_SIZE + index * ENTRY_RECORD_SIZE) as u32
    }

    /// Medium offset of cluster-list slot `index`, relative to `start_addr`.
    pub(crate) fn slot_offset(&self, index: usize) -> u32 {
        (SUPERBLOCK_SIZE
            + self.max_entries() * ENTRY_RECORD_SIZE
            + index * CLUSTER_LIST_SLOT_SIZE) as u32
    }

    /// Medium offset of cluster `cluster`, relative to `start_addr`.
    pub(crate) fn cluster_offset(&self, cluster: u16) -> u32 {
        cluster as u32 * self.cluster_size as u32
    }

    /// Size of the reserved region in bytes.
    pub(crate) fn reserved_bytes(&self) -> u32 {
        self.sys_clusters as u32 * self.cluster_size as u32
    }
}

impl Display for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Superblock {{")?;
        writeln!(f, "    version: {}.{}", self.version >> 8, self.version & 0xFF)?;
        writeln!(f, "    cluster_size: {}", self.cluster_size)?;
        writeln!(f, "    total_clusters: {}", self.total_clusters)?;
        writeln!(f, "    sys_clusters: {}", self.sys_clusters)?;
        writeln!(f, "    data_entries: {}", self.data_entries)?;
        writeln!(f, "    free_clusters: {}", self.free_clusters)?;
        write!(f, "}}")
    }
}
