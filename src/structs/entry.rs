use std::fmt::Display;

use super::*;

impl DataEntry {
    /// Fresh entry for `id`. The caller has already validated the length.
    pub(crate) fn new(id: &str) -> Self {
        let mut data_id = [0u8; MAX_DATA_ID_LEN];
        let bytes = id.as_bytes();
        let len = bytes.len().min(MAX_DATA_ID_LEN - 1);
        data_id[..len].copy_from_slice(&bytes[..len]);
        Self {
            data_id,
            data_size: 0,
            cluster_count: 0,
            cluster_list: Vec::new(),
            crc32: 0,
            is_valid: true,
        }
    }

    pub fn id(&self) -> &str {
        let end = self
            .data_id
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(MAX_DATA_ID_LEN);
        std::str::from_utf8(&self.data_id[..end]).unwrap_or("<invalid>")
    }

    pub fn size(&self) -> u32 {
        self.data_size
    }

    /// Byte-exact, case-sensitive identifier comparison.
    pub(crate) fn matches(&self, id: &str) -> bool {
        let bytes = id.as_bytes();
        if bytes.len() >= MAX_DATA_ID_LEN {
            return false;
        }
        self.is_valid
            && self.data_id[..bytes.len()] == *bytes
            && self.data_id[bytes.len()] == 0
    }

    /// Serialize the fixed-width record. The in-memory cluster list is not
    /// part of the record; it lives in the entry's slot.
    pub(crate) fn encode_record(&self) -> [u8; ENTRY_RECORD_SIZE] {
        let mut raw = [0u8; ENTRY_RECORD_SIZE];
        raw[0..32].copy_from_slice(&self.data_id);
        raw[32..36].copy_from_slice(&self.data_size.to_le_bytes());
        raw[36..38].copy_from_slice(&self.cluster_count.to_le_bytes());
        raw[38..42].copy_from_slice(&self.crc32.to_le_bytes());
        raw[42] = self.is_valid as u8;
        raw
    }

    pub(crate) fn decode_record(raw: &[u8; ENTRY_RECORD_SIZE]) -> Self {
        let mut data_id = [0u8; MAX_DATA_ID_LEN];
        data_id.copy_from_slice(&raw[0..32]);
        Self {
            data_id,
            data_size: u32_from_bytes(&raw[32..36]),
            cluster_count: u16_from_bytes(&raw[36..38]),
            cluster_list: Vec::new(),
            crc32: u32_from_bytes(&raw[38..42]),
            is_valid: raw[42] != 0,
        }
    }

    /// Serialize the cluster list into a full slot, zero-filled past
    /// `cluster_count`.
    pub(crate) fn encode_slot(&self) -> [u8; CLUSTER_LIST_SLOT_SIZE] {
        let mut raw = [0u8; CLUSTER_LIST_SLOT_SIZE];
        for (i, cluster) in self.cluster_list.iter().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&cluster.to_le_bytes());
        }
        raw
    }

    /// Restore the cluster list from a slot; only the first `cluster_count`
    /// positions are meaningful.
    pub(crate) fn decode_slot(&mut self, raw: &[u8; CLUSTER_LIST_SLOT_SIZE]) {
        self.cluster_list = (0..self.cluster_count as usize)
            .map(|i| u16_from_bytes(&raw[i * 2..i * 2 + 2]))
            .collect();
    }
}

impl Display for DataEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DataEntry {{ id: {:?}, size: {}, clusters: {:?} }}",
            self.id(),
            self.data_size,
            self.cluster_list
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let mut entry = DataEntry::new("sensor_calibration");
        entry.data_size = 500;
        entry.cluster_count = 2;
        entry.cluster_list = vec![7, 9];
        entry.crc32 = 0xDEAD_BEEF;
        let decoded = DataEntry::decode_record(&entry.encode_record());
        assert_eq!(decoded.id(), "sensor_calibration");
        assert_eq!(decoded.data_size, 500);
        assert_eq!(decoded.cluster_count, 2);
        assert_eq!(decoded.crc32, 0xDEAD_BEEF);
        assert!(decoded.is_valid);
        assert!(decoded.cluster_list.is_empty());
    }

    #[test]
    fn slot_round_trip() {
        let mut entry = DataEntry::new("x");
        entry.cluster_count = 3;
        entry.cluster_list = vec![2, 300, 65_000];
        let raw = entry.encode_slot();
        let mut restored = DataEntry::decode_record(&entry.encode_record());
        restored.decode_slot(&raw);
        assert_eq!(restored.cluster_list, vec![2, 300, 65_000]);
    }

    #[test]
    fn slot_tail_is_zeroed() {
        let mut entry = DataEntry::new("x");
        entry.cluster_count = 1;
        entry.cluster_list = vec![5];
        let raw = entry.encode_slot();
        assert!(raw[2..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn longest_legal_id() {
        let id = "a".repeat(31);
        let entry = DataEntry::new(&id);
        assert_eq!(entry.id(), id);
        assert!(entry.matches(&id));
        assert_eq!(entry.data_id[31], 0);
    }

    #[test]
    fn matching_is_exact() {
        let entry = DataEntry::new("Config");
        assert!(entry.matches("Config"));
        assert!(!entry.matches("config"));
        assert!(!entry.matches("Conf"));
        assert!(!entry.matches("Configs"));
        assert!(!entry.matches(&"a".repeat(40)));
    }

    #[test]
    fn invalid_entry_never_matches() {
        let mut entry = DataEntry::new("ghost");
        entry.is_valid = false;
        assert!(!entry.matches("ghost"));
    }
}
