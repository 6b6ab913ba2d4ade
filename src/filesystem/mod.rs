use log::{debug, warn};

use crate::crc::crc32;
use crate::storage::Storage;
use crate::structs::*;
use crate::Error;

/// Mount-time configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Cluster size in bytes, a power of two in `[64, 4096]`.
    pub cluster_size: u16,
    /// Clusters reserved for the superblock and directory; zero derives
    /// the minimum from the superblock size.
    pub reserved_clusters: u16,
    /// Format the medium when no valid filesystem is found on it.
    pub format_if_invalid: bool,
    /// Verify each blob's CRC on read.
    pub enable_crc_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_size: 256,
            reserved_clusters: 0,
            format_if_invalid: false,
            enable_crc_check: true,
        }
    }
}

/// Space accounting over the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total_bytes: u32,
    pub used_bytes: u32,
    pub free_bytes: u32,
    pub data_entries: u16,
}

/// A mounted filesystem instance.
///
/// Mounting is construction and unmounting consumes the handle, so every
/// method call runs against a live filesystem by construction.
#[derive(Debug)]
pub struct Filesystem {
    device: Box<dyn Storage>,
    superblock: Superblock,
    entries: Vec<DataEntry>,
    max_entries: usize,
    bitmap: Bitmap,
    cluster_buffer: Vec<u8>,
    crc_check: bool,
}

fn validate_cluster_size(cluster_size: u16) -> Result<(), Error> {
    if cluster_size < CLUSTER_SIZE_MIN
        || cluster_size > CLUSTER_SIZE_MAX
        || !cluster_size.is_power_of_two()
    {
        return Err(Error::InvalidParam);
    }
    Ok(())
}

/// Erase-first media must be able to cycle single clusters, so the erase
/// block has to divide the cluster size.
fn validate_erase_geometry(device: &dyn Storage, cluster_size: u16) -> Result<(), Error> {
    let geometry = device.geometry();
    if geometry.need_erase
        && (geometry.erase_block_size == 0
            || cluster_size as u32 % geometry.erase_block_size != 0)
    {
        return Err(Error::InvalidParam);
    }
    Ok(())
}

fn clusters_needed(cluster_size: u16, size: usize) -> usize {
    (size + cluster_size as usize - 1) / cluster_size as usize
}

impl Filesystem {
    /// Mount the filesystem on `device`.
    ///
    /// A medium without a valid filesystem (or with one formatted to a
    /// different cluster size) is formatted fresh when
    /// `format_if_invalid` is set and rejected with
    /// [`Error::InvalidFilesystem`] otherwise.
    pub fn mount(mut device: Box<dyn Storage>, config: &Config) -> Result<Self, Error> {
        validate_cluster_size(config.cluster_size)?;
        validate_erase_geometry(device.as_ref(), config.cluster_size)?;

        let superblock = match Superblock::load(device.as_mut()) {
            Ok(superblock) if superblock.cluster_size == config.cluster_size => superblock,
            _ if config.format_if_invalid => {
                Self::format(device.as_mut(), config)?;
                Superblock::load(device.as_mut())?
            }
            _ => {
                debug!("no mountable filesystem on device");
                return Err(Error::InvalidFilesystem);
            }
        };

        let max_entries = superblock.max_entries();
        if superblock.sys_clusters >= superblock.total_clusters
            || superblock.data_entries as usize > max_entries
        {
            return Err(Error::InvalidFilesystem);
        }

        let mut filesystem = Self {
            cluster_buffer: vec![0; superblock.cluster_size as usize],
            bitmap: Bitmap::new(superblock.total_clusters),
            entries: Vec::with_capacity(max_entries),
            max_entries,
            superblock,
            device,
            crc_check: config.enable_crc_check,
        };
        filesystem.load_entries()?;
        filesystem
            .bitmap
            .rebuild(filesystem.superblock.sys_clusters, &filesystem.entries)?;
        debug!(
            "mounted: {} entries, {} free clusters",
            filesystem.superblock.data_entries, filesystem.superblock.free_clusters
        );
        Ok(filesystem)
    }

    /// Unmount and hand the device back.
    pub fn unmount(self) -> Box<dyn Storage> {
        self.device
    }

    /// Write a fresh, empty filesystem onto `device`.
    pub fn format(device: &mut dyn Storage, config: &Config) -> Result<(), Error> {
        validate_cluster_size(config.cluster_size)?;
        validate_erase_geometry(device, config.cluster_size)?;
        let geometry = device.geometry();
        let cluster_size = config.cluster_size as u32;

        let total_clusters = geometry.size / cluster_size;
        if total_clusters == 0 || total_clusters > u16::MAX as u32 {
            return Err(Error::InvalidParam);
        }
        let total_clusters = total_clusters as u16;
        let sys_clusters = if config.reserved_clusters == 0 {
            (SUPERBLOCK_SIZE as u32).div_ceil(cluster_size).max(2) as u16
        } else {
            config.reserved_clusters
        };
        if sys_clusters >= total_clusters {
            return Err(Error::InvalidParam);
        }

        let mut superblock = Superblock::new(config.cluster_size, total_clusters, sys_clusters);
        if superblock.max_entries() == 0 {
            return Err(Error::InvalidParam);
        }

        if geometry.need_erase {
            device.erase(geometry.start_addr, superblock.reserved_bytes())?;
        }
        superblock.flush(device)?;
        let zero_cluster = vec![0u8; config.cluster_size as usize];
        for cluster in 1..sys_clusters {
            let addr = geometry.start_addr + superblock.cluster_offset(cluster);
            device.write(addr, &zero_cluster)?;
        }
        debug!("formatted: {total_clusters} clusters of {cluster_size} bytes, {sys_clusters} reserved");
        Ok(())
    }

    /// Store `data` under `id`, creating or overwriting the entry.
    pub fn write(&mut self, id: &str, data: &[u8]) -> Result<(), Error> {
        if id.is_empty() || id.len() >= MAX_DATA_ID_LEN || data.is_empty() {
            return Err(Error::InvalidParam);
        }
        let needed = clusters_needed(self.superblock.cluster_size, data.len());
        if needed > MAX_CLUSTERS_PER_ENTRY {
            return Err(Error::NoSpace);
        }
        let needed = needed as u16;

        let index = match self.find_entry(id) {
            Some(index) => {
                if self.entries[index].cluster_count != needed {
                    // Claim the replacement chain before releasing the old
                    // one, so a failed rewrite leaves the entry readable.
                    let list = self.acquire_clusters(needed)?;
                    let old = std::mem::replace(&mut self.entries[index].cluster_list, list);
                    self.release_clusters(&old);
                    self.entries[index].cluster_count = needed;
                }
                index
            }
            None => {
                if self.entries.len() == self.max_entries {
                    return Err(Error::ClusterFull);
                }
                let mut entry = DataEntry::new(id);
                entry.cluster_list = self.acquire_clusters(needed)?;
                entry.cluster_count = needed;
                self.entries.push(entry);
                self.superblock.data_entries += 1;
                self.entries.len() - 1
            }
        };

        self.entries[index].data_size = data.len() as u32;
        self.entries[index].crc32 = crc32(data);

        let list = self.entries[index].cluster_list.clone();
        self.write_payload(&list, data)?;
        self.persist_metadata()?;
        debug!("wrote {} bytes to {id:?} in {needed} clusters", data.len());
        Ok(())
    }

    /// Read the blob stored under `id` into `buf` and return its size.
    ///
    /// `buf` must hold at least the blob's `data_size` bytes; query
    /// [`size_of`](Self::size_of) first when the size is unknown.
    pub fn read(&mut self, id: &str, buf: &mut [u8]) -> Result<usize, Error> {
        if id.is_empty() {
            return Err(Error::InvalidParam);
        }
        let index = self.find_entry(id).ok_or(Error::DataNotFound)?;
        let size = self.entries[index].data_size as usize;
        if buf.len() < size {
            return Err(Error::InvalidParam);
        }
        let list = self.entries[index].cluster_list.clone();
        let expected = self.entries[index].crc32;

        let cluster_size = self.superblock.cluster_size as usize;
        let start_addr = self.device.geometry().start_addr;
        for (i, &cluster) in list.iter().enumerate() {
            let addr = start_addr + self.superblock.cluster_offset(cluster);
            let offset = i * cluster_size;
            if offset + cluster_size <= size {
                self.device.read(addr, &mut buf[offset..offset + cluster_size])?;
            } else {
                // Bounce the trailing cluster through the scratch buffer;
                // the caller's buffer only has to fit the logical bytes.
                self.device.read(addr, &mut self.cluster_buffer)?;
                buf[offset..size].copy_from_slice(&self.cluster_buffer[..size - offset]);
            }
        }

        if self.crc_check && crc32(&buf[..size]) != expected {
            warn!("crc mismatch reading {id:?}");
            return Err(Error::CrcMismatch);
        }
        Ok(size)
    }

    /// Remove the entry stored under `id` and release its clusters.
    pub fn delete(&mut self, id: &str) -> Result<(), Error> {
        let index = self.find_entry(id).ok_or(Error::DataNotFound)?;
        let entry = self.entries.remove(index);
        self.release_clusters(&entry.cluster_list);
        self.superblock.data_entries -= 1;
        self.persist_metadata()?;
        debug!("deleted {id:?}, released {} clusters", entry.cluster_count);
        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.find_entry(id).is_some()
    }

    /// Stored size of the blob under `id` in bytes.
    pub fn size_of(&self, id: &str) -> Result<u32, Error> {
        let index = self.find_entry(id).ok_or(Error::DataNotFound)?;
        Ok(self.entries[index].data_size)
    }

    /// Unallocated data-region bytes.
    pub fn free_space(&self) -> u32 {
        self.superblock.free_clusters as u32 * self.superblock.cluster_size as u32
    }

    pub fn stats(&self) -> Stats {
        let cluster_size = self.superblock.cluster_size as u32;
        let total_bytes = (self.superblock.total_clusters - self.superblock.sys_clusters) as u32
            * cluster_size;
        let free_bytes = self.superblock.free_clusters as u32 * cluster_size;
        Stats {
            total_bytes,
            used_bytes: total_bytes - free_bytes,
            free_bytes,
            data_entries: self.superblock.data_entries,
        }
    }

    /// Re-read every live blob and verify its CRC; the first failure is
    /// reported as [`Error::DataCorrupted`].
    pub fn check_integrity(&mut self) -> Result<(), Error> {
        let cluster_size = self.superblock.cluster_size as usize;
        let start_addr = self.device.geometry().start_addr;
        for index in 0..self.entries.len() {
            if !self.entries[index].is_valid {
                continue;
            }
            let list = self.entries[index].cluster_list.clone();
            let size = self.entries[index].data_size as usize;
            let expected = self.entries[index].crc32;
            let mut payload = vec![0u8; list.len() * cluster_size];
            for (i, &cluster) in list.iter().enumerate() {
                let addr = start_addr + self.superblock.cluster_offset(cluster);
                self.device
                    .read(addr, &mut payload[i * cluster_size..(i + 1) * cluster_size])?;
            }
            if crc32(&payload[..size]) != expected {
                warn!("integrity check failed for {:?}", self.entries[index].id());
                return Err(Error::DataCorrupted);
            }
        }
        Ok(())
    }

    /// Present for API completeness: cluster chains stay where the
    /// allocator placed them and the call reports success. A moving
    /// variant would have to journal relocations so power loss cannot
    /// leave a blob half-moved.
    pub fn defragment(&mut self) -> Result<(), Error> {
        Ok(())
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Iterate over the live directory entries.
    pub fn entries(&self) -> impl Iterator<Item = &DataEntry> + '_ {
        self.entries.iter().filter(|entry| entry.is_valid)
    }

    pub fn cluster_size(&self) -> u16 {
        self.superblock.cluster_size
    }

    pub fn total_clusters(&self) -> u16 {
        self.superblock.total_clusters
    }

    pub fn sys_clusters(&self) -> u16 {
        self.superblock.sys_clusters
    }

    pub fn free_clusters(&self) -> u16 {
        self.superblock.free_clusters
    }

    pub fn entry_count(&self) -> u16 {
        self.superblock.data_entries
    }

    /// Directory capacity in entries.
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    fn find_entry(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.matches(id))
    }

    /// Claim `count` clusters in ascending index order, or fail with
    /// [`Error::NoSpace`] leaving the bitmap unchanged.
    fn acquire_clusters(&mut self, count: u16) -> Result<Vec<u16>, Error> {
        if self.superblock.free_clusters < count {
            return Err(Error::NoSpace);
        }
        let mut list = Vec::with_capacity(count as usize);
        let mut from = self.superblock.sys_clusters;
        while (list.len() as u16) < count {
            match self.bitmap.next_free(from) {
                Some(cluster) => {
                    self.bitmap.set(cluster, true);
                    list.push(cluster);
                    from = cluster + 1;
                }
                None => {
                    // Put back whatever the partial scan claimed.
                    for &cluster in &list {
                        self.bitmap.set(cluster, false);
                    }
                    return Err(Error::NoSpace);
                }
            }
        }
        self.superblock.free_clusters -= count;
        Ok(list)
    }

    fn release_clusters(&mut self, list: &[u16]) {
        for &cluster in list {
            debug_assert!(self.bitmap.get(cluster));
            self.bitmap.set(cluster, false);
        }
        self.superblock.free_clusters += list.len() as u16;
    }

    fn load_entries(&mut self) -> Result<(), Error> {
        let start_addr = self.device.geometry().start_addr;
        for index in 0..self.superblock.data_entries as usize {
            let mut raw = [0u8; ENTRY_RECORD_SIZE];
            self.device
                .read(start_addr + self.superblock.entry_offset(index), &mut raw)?;
            let mut entry = DataEntry::decode_record(&raw);
            if entry.cluster_count as usize > MAX_CLUSTERS_PER_ENTRY {
                return Err(Error::DataCorrupted);
            }
            let mut slot = [0u8; CLUSTER_LIST_SLOT_SIZE];
            self.device
                .read(start_addr + self.superblock.slot_offset(index), &mut slot)?;
            entry.decode_slot(&slot);
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Write the blob to its cluster chain, whole clusters per iteration.
    fn write_payload(&mut self, list: &[u16], data: &[u8]) -> Result<(), Error> {
        let geometry = self.device.geometry();
        let cluster_size = self.superblock.cluster_size as usize;
        for (i, &cluster) in list.iter().enumerate() {
            let addr = geometry.start_addr + self.superblock.cluster_offset(cluster);
            if geometry.need_erase {
                self.device.erase(addr, cluster_size as u32)?;
            }
            let chunk = &data[i * cluster_size..];
            if chunk.len() >= cluster_size {
                self.device.write(addr, &chunk[..cluster_size])?;
            } else {
                // Stage the trailing partial cluster so the medium still
                // sees a whole-cluster write.
                self.cluster_buffer[..chunk.len()].copy_from_slice(chunk);
                self.cluster_buffer[chunk.len()..].fill(0);
                self.device.write(addr, &self.cluster_buffer)?;
            }
        }
        Ok(())
    }

    /// Persist the superblock, the live entry records and their
    /// cluster-list slots, in that order.
    fn persist_metadata(&mut self) -> Result<(), Error> {
        let geometry = self.device.geometry();
        if geometry.need_erase {
            self.device
                .erase(geometry.start_addr, self.superblock.reserved_bytes())?;
        }
        self.superblock.flush(self.device.as_mut())?;
        for index in 0..self.entries.len() {
            let record = self.entries[index].encode_record();
            self.device
                .write(geometry.start_addr + self.superblock.entry_offset(index), &record)?;
            let slot = self.entries[index].encode_slot();
            self.device
                .write(geometry.start_addr + self.superblock.slot_offset(index), &slot)?;
        }
        if !geometry.need_erase && self.entries.len() < self.max_entries {
            // Scrub the record past the live tail so a deleted entry does
            // not linger on the medium.
            let blank = [0u8; ENTRY_RECORD_SIZE];
            self.device.write(
                geometry.start_addr + self.superblock.entry_offset(self.entries.len()),
                &blank,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EepromStorage;

    fn mounted(size: u32, cluster_size: u16, reserved: u16) -> Filesystem {
        let dev = Box::new(EepromStorage::new(0, size));
        let config = Config {
            cluster_size,
            reserved_clusters: reserved,
            format_if_invalid: true,
            ..Config::default()
        };
        Filesystem::mount(dev, &config).unwrap()
    }

    #[test]
    fn format_geometry() {
        let fs = mounted(4096, 128, 2);
        assert_eq!(fs.total_clusters(), 32);
        assert_eq!(fs.sys_clusters(), 2);
        assert_eq!(fs.free_clusters(), 30);
        assert_eq!(fs.entry_count(), 0);
    }

    #[test]
    fn auto_reserved_clusters() {
        let fs = mounted(32 * 1024, 128, 0);
        assert_eq!(fs.sys_clusters(), 2);
    }

    #[test]
    fn format_rejects_bad_cluster_sizes() {
        for cluster_size in [0u16, 32, 100, 8192] {
            let mut dev = EepromStorage::new(0, 32 * 1024);
            let config = Config {
                cluster_size,
                ..Config::default()
            };
            assert_eq!(
                Filesystem::format(&mut dev, &config).unwrap_err(),
                Error::InvalidParam
            );
        }
    }

    #[test]
    fn format_rejects_degenerate_geometry() {
        // Reservation swallows the whole medium.
        let mut dev = EepromStorage::new(0, 1024);
        let config = Config {
            cluster_size: 256,
            reserved_clusters: 4,
            ..Config::default()
        };
        assert_eq!(
            Filesystem::format(&mut dev, &config).unwrap_err(),
            Error::InvalidParam
        );

        // Medium smaller than one cluster.
        let mut dev = EepromStorage::new(0, 60);
        let config = Config {
            cluster_size: 64,
            ..Config::default()
        };
        assert_eq!(
            Filesystem::format(&mut dev, &config).unwrap_err(),
            Error::InvalidParam
        );

        // More clusters than a 16-bit index can address.
        let mut dev = EepromStorage::new(0, 65_536 * 64);
        let config = Config {
            cluster_size: 64,
            ..Config::default()
        };
        assert_eq!(
            Filesystem::format(&mut dev, &config).unwrap_err(),
            Error::InvalidParam
        );
    }

    #[test]
    fn acquire_in_ascending_order() {
        let mut fs = mounted(4096, 128, 2);
        assert_eq!(fs.acquire_clusters(3).unwrap(), vec![2, 3, 4]);
        assert_eq!(fs.free_clusters(), 27);
        fs.release_clusters(&[3]);
        assert_eq!(fs.free_clusters(), 28);
        assert_eq!(fs.acquire_clusters(2).unwrap(), vec![3, 5]);
    }

    #[test]
    fn acquire_everything_then_nothing() {
        let mut fs = mounted(4096, 128, 2);
        let all = fs.acquire_clusters(30).unwrap();
        assert_eq!(all.len(), 30);
        assert_eq!(fs.free_clusters(), 0);
        assert_eq!(fs.acquire_clusters(1).unwrap_err(), Error::NoSpace);
    }

    #[test]
    fn acquire_rolls_back_a_partial_scan() {
        let mut fs = mounted(4096, 128, 2);
        // Make the free counter lie: one cluster claimed behind its back.
        fs.bitmap.set(31, true);
        assert_eq!(fs.acquire_clusters(30).unwrap_err(), Error::NoSpace);
        for cluster in 2..31 {
            assert!(!fs.bitmap.get(cluster));
        }
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let mut fs = mounted(512 * 1024, 128, 16);
        let data = vec![0u8; (MAX_CLUSTERS_PER_ENTRY + 1) * 128];
        assert_eq!(fs.write("big", &data).unwrap_err(), Error::NoSpace);
        assert!(!fs.exists("big"));
    }
}
