use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_COUNT: u32 = 4096;

pub const RESERVED_SECTORS: u32 = 8;
pub const FAT_COPIES: u8 = 2;
pub const SECTORS_PER_FAT: u32 = 12;
pub const ROOT_ENTRY_COUNT: u16 = 512;
pub const ROOT_SECTORS: u32 = ROOT_ENTRY_COUNT as u32 * 32 / SECTOR_SIZE as u32;

pub const FAT1_FIRST_SECTOR: u32 = RESERVED_SECTORS;
pub const FAT2_FIRST_SECTOR: u32 = FAT1_FIRST_SECTOR + SECTORS_PER_FAT;
pub const ROOT_FIRST_SECTOR: u32 = FAT2_FIRST_SECTOR + SECTORS_PER_FAT;
pub const DATA_FIRST_SECTOR: u32 = ROOT_FIRST_SECTOR + ROOT_SECTORS;

const_assert_eq!(FAT1_FIRST_SECTOR, 8);
const_assert_eq!(FAT2_FIRST_SECTOR, 20);
const_assert_eq!(ROOT_FIRST_SECTOR, 32);
const_assert_eq!(DATA_FIRST_SECTOR, 64);

/// FAT12/16 BIOS parameter block, as laid out in sector 0. Most fields sit
/// at odd offsets, hence the packed representation.
#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, packed)]
pub struct BootSector {
    pub jump_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub fat_count: u8,
    pub root_entry_count: u16,

    /// Legacy 16-bit total. The 32-bit `total_sectors_32` field is only
    /// consulted when this one is zero.
    pub total_sectors_16: u16,

    pub media_descriptor: u8,
    pub sectors_per_fat: u16,
    pub sectors_per_track: u16,
    pub head_count: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub drive_number: u8,
    reserved: u8,
    pub extended_boot_signature: u8,
    pub volume_serial_number: u32,
    pub volume_label: [u8; 11],
    pub filesystem_type: [u8; 8],
    pub boot_code: [u8; 448],
    pub boot_signature: [u8; 2],
}

const_assert_eq!(core::mem::size_of::<BootSector>(), SECTOR_SIZE);

/// Synthesize the constant boot sector for the volume.
pub fn build_boot_sector(volume_serial_number: u32) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];

    let region: &mut BootSector = bytemuck::from_bytes_mut(&mut sector);
    region.jump_boot = [0xEB, 0x3C, 0x90];
    region.oem_name = *b"mkdosfs\0";
    region.bytes_per_sector = SECTOR_SIZE as u16;
    region.sectors_per_cluster = 1;
    region.reserved_sector_count = RESERVED_SECTORS as u16;
    region.fat_count = FAT_COPIES;
    region.root_entry_count = ROOT_ENTRY_COUNT;
    region.total_sectors_16 = SECTOR_COUNT as u16;
    region.media_descriptor = 0xF8;
    region.sectors_per_fat = SECTORS_PER_FAT as u16;
    region.sectors_per_track = 1;
    region.head_count = 1;
    region.drive_number = 0;
    region.extended_boot_signature = 0x29;
    region.volume_serial_number = volume_serial_number;
    region.volume_label = *b"RAMDISK    ";
    region.filesystem_type = *b"FAT12   ";
    region.boot_signature = [0x55, 0xAA];

    sector
}

#[test]
fn boot_sector_layout() {
    let sector = build_boot_sector(0x6CE4_98A2);

    assert_eq!(&sector[0..3], &[0xEB, 0x3C, 0x90]);
    assert_eq!(&sector[3..11], b"mkdosfs\0");
    assert_eq!(&sector[11..13], &512u16.to_le_bytes());
    assert_eq!(sector[13], 1); // sectors per cluster
    assert_eq!(&sector[14..16], &8u16.to_le_bytes());
    assert_eq!(sector[16], 2); // FAT copies
    assert_eq!(&sector[17..19], &512u16.to_le_bytes());
    assert_eq!(&sector[19..21], &4096u16.to_le_bytes());
    assert_eq!(sector[21], 0xF8);
    assert_eq!(&sector[22..24], &12u16.to_le_bytes());
    assert_eq!(sector[38], 0x29);
    assert_eq!(&sector[39..43], &[0xA2, 0x98, 0xE4, 0x6C]);
    assert_eq!(&sector[43..54], b"RAMDISK    ");
    assert_eq!(&sector[54..62], b"FAT12   ");
    assert_eq!(&sector[510..512], &[0x55, 0xAA]);
}

#[test]
fn boot_code_stays_zeroed() {
    let sector = build_boot_sector(0);
    assert_eq!(&sector[62..510], &[0u8; 448]);
}
