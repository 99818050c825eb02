use arbitrary_int::u2;
use bitbybit::bitfield;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::boot_region::SECTOR_SIZE;
use crate::fat_region::FIRST_DATA_CLUSTER;

pub const DIR_ENTRY_SIZE: usize = 32;

/// Only the first root-directory sector is mirrored in RAM.
pub const ROOT_WINDOW_ENTRIES: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

/// 8.3 short name of the configuration file.
pub const CONFIG_FILE_NAME: [u8; 11] = *b"CONFIG  TXT";

// Fixed modification stamp carried by the synthesized entry
// (2012-06-29 17:40:48).
const WRITE_TIME: u16 = 0x8D18;
const WRITE_DATE: u16 = 0x40DD;

#[bitfield(u8)]
#[derive(Debug, Zeroable, Pod, PartialEq)]
pub struct FileAttributes {
    #[bit(0, rw)]
    read_only: bool,

    #[bit(1, rw)]
    hidden: bool,

    #[bit(2, rw)]
    system: bool,

    #[bit(3, rw)]
    volume_label: bool,

    #[bit(4, rw)]
    directory: bool,

    #[bit(5, rw)]
    archive: bool,

    #[bits(6..=7, rw)]
    reserved: u2,
}

/// Classic 32-byte FAT directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct DirectoryEntry {
    pub name: [u8; 11],
    pub attributes: FileAttributes,
    reserved: u8,
    create_time_tenths: u8,
    create_time: u16,
    create_date: u16,
    last_access_date: u16,

    /// High half of the starting cluster; always zero on FAT12.
    first_cluster_high: u16,

    write_time: u16,
    write_date: u16,
    first_cluster_low: u16,
    file_size: u32,
}

const_assert_eq!(core::mem::size_of::<DirectoryEntry>(), DIR_ENTRY_SIZE);

impl DirectoryEntry {
    /// Entry for the configuration file as the engine creates it: data at
    /// cluster 2, fixed write stamp.
    pub fn config_file(file_size: u32) -> Self {
        Self {
            name: CONFIG_FILE_NAME,
            attributes: FileAttributes::new_with_raw_value(0),
            reserved: 0,
            create_time_tenths: 0,
            create_time: 0,
            create_date: 0,
            last_access_date: 0,
            first_cluster_high: 0,
            write_time: WRITE_TIME,
            write_date: WRITE_DATE,
            first_cluster_low: FIRST_DATA_CLUSTER,
            file_size,
        }
    }

    pub fn first_cluster(&self) -> u16 {
        self.first_cluster_low
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }
}

pub fn read_entry(root: &[u8], index: usize) -> DirectoryEntry {
    bytemuck::pod_read_unaligned(&root[index * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE])
}

pub fn write_entry(root: &mut [u8], index: usize, entry: &DirectoryEntry) {
    root[index * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE].copy_from_slice(bytemuck::bytes_of(entry));
}

/// Search the root window for the configuration file, matching the short
/// name case-insensitively.
pub fn find_config(root: &[u8]) -> Option<(usize, DirectoryEntry)> {
    for index in 0..ROOT_WINDOW_ENTRIES {
        let entry = read_entry(root, index);

        let mut name = entry.name;
        name.make_ascii_uppercase();
        if name == CONFIG_FILE_NAME {
            return Some((index, entry));
        }
    }

    None
}

/// Pin the entry at `index` to the canonical layout: data starting at
/// cluster 2 with the exact rendered size, whatever the host wrote there.
pub fn normalize_config(root: &mut [u8], index: usize, file_size: u32) {
    let mut entry = read_entry(root, index);
    entry.first_cluster_low = FIRST_DATA_CLUSTER;
    entry.file_size = file_size;
    write_entry(root, index, &entry);
}

#[test]
fn synthesized_entry_layout() {
    let mut root = [0u8; SECTOR_SIZE];
    write_entry(&mut root, 0, &DirectoryEntry::config_file(24));

    assert_eq!(&root[0..11], b"CONFIG  TXT");
    assert_eq!(root[11], 0); // attributes
    assert_eq!(&root[22..26], &[0x18, 0x8D, 0xDD, 0x40]); // write stamp
    assert_eq!(&root[26..28], &[0x02, 0x00]); // starting cluster
    assert_eq!(&root[28..32], &24u32.to_le_bytes());
}

#[test]
fn find_is_case_insensitive() {
    let mut root = [0u8; SECTOR_SIZE];

    let mut entry = DirectoryEntry::config_file(100);
    entry.name = *b"config  txt";
    write_entry(&mut root, 3, &entry);

    let (index, found) = find_config(&root).unwrap();
    assert_eq!(index, 3);
    assert_eq!(found.file_size(), 100);
    assert_eq!(found.first_cluster(), 2);
}

#[test]
fn find_misses_empty_root() {
    let root = [0u8; SECTOR_SIZE];
    assert_eq!(find_config(&root), None);

    let erased = [0xFFu8; SECTOR_SIZE];
    assert_eq!(find_config(&erased), None);
}

#[test]
fn normalize_overrides_host_allocation() {
    let mut root = [0u8; SECTOR_SIZE];

    let mut entry = DirectoryEntry::config_file(512);
    entry.first_cluster_low = 5;
    entry.attributes = FileAttributes::new_with_raw_value(0).with_archive(true);
    write_entry(&mut root, 1, &entry);

    normalize_config(&mut root, 1, 24);

    let (index, found) = find_config(&root).unwrap();
    assert_eq!(index, 1);
    assert_eq!(found.first_cluster(), 2);
    assert_eq!(found.file_size(), 24);
    assert!(found.attributes.archive()); // host attributes survive
}
