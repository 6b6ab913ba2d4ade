#![allow(dead_code)]

use acfs::{Config, EepromStorage, Filesystem};

pub fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config(cluster_size: u16, reserved_clusters: u16) -> Config {
    Config {
        cluster_size,
        reserved_clusters,
        format_if_invalid: true,
        enable_crc_check: true,
    }
}

pub fn mount_eeprom(size: u32, cluster_size: u16, reserved_clusters: u16) -> Filesystem {
    setup();
    let dev = Box::new(EepromStorage::new(0, size));
    Filesystem::mount(dev, &config(cluster_size, reserved_clusters)).unwrap()
}
