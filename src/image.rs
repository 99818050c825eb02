use static_assertions::{const_assert, const_assert_eq};

use crate::boot_region::SECTOR_SIZE;
use crate::flash::{Flash, FlashError};

/// Size of the persisted region and of its RAM mirror.
pub const IMAGE_SIZE: usize = 0x4000;

pub const FAT1_OFFSET: usize = 0x000;
pub const FAT2_OFFSET: usize = 0x200;
pub const ROOT_OFFSET: usize = 0x400;
pub const FILE_OFFSET: usize = 0x600;

/// Bytes available for file data, cluster 2 at the start.
pub const FILE_WINDOW_SIZE: usize = IMAGE_SIZE - FILE_OFFSET;

/// Dirty tracking granule. One bit of the bitmap covers one page.
pub const FLASH_PAGE_SIZE: usize = 512;
pub const PAGE_COUNT: usize = IMAGE_SIZE / FLASH_PAGE_SIZE;

const_assert_eq!(PAGE_COUNT, 32);
const_assert!(FILE_WINDOW_SIZE % SECTOR_SIZE == 0);

/// RAM mirror of the persisted region, subdivided into the FAT1, FAT2,
/// root-directory and file-data windows, with a page dirty bitmap.
pub struct DiskImage {
    buffer: [u8; IMAGE_SIZE],
    dirty: u32,
}

impl DiskImage {
    pub fn new() -> Self {
        Self {
            buffer: [0; IMAGE_SIZE],
            dirty: 0,
        }
    }

    pub fn fat1(&self) -> &[u8] {
        &self.buffer[FAT1_OFFSET..FAT1_OFFSET + SECTOR_SIZE]
    }

    pub fn fat1_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[FAT1_OFFSET..FAT1_OFFSET + SECTOR_SIZE]
    }

    pub fn fat2(&self) -> &[u8] {
        &self.buffer[FAT2_OFFSET..FAT2_OFFSET + SECTOR_SIZE]
    }

    pub fn fat2_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[FAT2_OFFSET..FAT2_OFFSET + SECTOR_SIZE]
    }

    pub fn root(&self) -> &[u8] {
        &self.buffer[ROOT_OFFSET..ROOT_OFFSET + SECTOR_SIZE]
    }

    pub fn root_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[ROOT_OFFSET..ROOT_OFFSET + SECTOR_SIZE]
    }

    pub fn file_window(&self) -> &[u8] {
        &self.buffer[FILE_OFFSET..]
    }

    pub fn file_window_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[FILE_OFFSET..]
    }

    /// Mirror FAT1 into FAT2.
    pub fn sync_fats(&mut self) {
        let (fat1, rest) = self.buffer[FAT1_OFFSET..].split_at_mut(SECTOR_SIZE);
        rest[..SECTOR_SIZE].copy_from_slice(fat1);
    }

    pub fn fill_zero(&mut self) {
        self.buffer.fill(0);
    }

    pub fn mark_dirty(&mut self, page: usize) {
        self.dirty |= 1 << page;
    }

    /// Mark every page overlapping `len` bytes at `offset`.
    pub fn mark_dirty_span(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        for page in offset / FLASH_PAGE_SIZE..=(offset + len - 1) / FLASH_PAGE_SIZE {
            self.mark_dirty(page);
        }
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty = u32::MAX;
    }

    pub fn clear_all_dirty(&mut self) {
        self.dirty = 0;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    /// Replace the mirror with the persisted region.
    pub fn load_from<F: Flash>(&mut self, flash: &F) {
        flash.read(0, &mut self.buffer);
        self.clear_all_dirty();
    }

    /// Persist the mirror if anything is dirty. The region erases as one
    /// unit, so a single dirty bit costs a full erase-program cycle.
    ///
    /// An erase failure aborts with the bitmap intact so the next call
    /// retries; program failures are logged and programming continues,
    /// leaving the mirror the source of truth until the next cycle.
    pub fn flush_dirty<F: Flash>(&mut self, flash: &mut F) -> Result<(), FlashError> {
        if self.dirty == 0 {
            return Ok(());
        }

        if let Err(err) = flash.unlock() {
            log::error!("unable to unlock flash: {err:?}");
        }

        log::trace!("erasing flash region");
        if let Err(err) = flash.erase() {
            log::error!("unable to erase flash region: {err:?}");
            let _ = flash.lock();
            return Err(err);
        }

        log::trace!("writing {} bytes to flash", IMAGE_SIZE);
        for (index, pair) in self.buffer.chunks_exact(2).enumerate() {
            let value = u16::from_le_bytes([pair[0], pair[1]]);
            if let Err(err) = flash.program_halfword(index * 2, value) {
                log::error!("unable to program flash at offset {}: {err:?}", index * 2);
            }
        }

        if let Err(err) = flash.lock() {
            log::error!("unable to lock flash: {err:?}");
        }

        self.clear_all_dirty();
        Ok(())
    }
}

impl Default for DiskImage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
use crate::flash::RamFlash;

#[test]
fn dirty_span_marks_covering_pages() {
    let mut image = DiskImage::new();
    assert!(!image.is_dirty());

    image.mark_dirty_span(FILE_OFFSET, 1);
    assert_eq!(image.dirty, 1 << 3);

    image.mark_dirty_span(FILE_OFFSET + 510, 4);
    assert_eq!(image.dirty, (1 << 3) | (1 << 4));

    image.mark_dirty_span(0, 0);
    assert_eq!(image.dirty, (1 << 3) | (1 << 4));

    image.clear_all_dirty();
    assert!(!image.is_dirty());
}

#[test]
fn flush_skips_clean_image() {
    let mut image = DiskImage::new();
    let mut flash = RamFlash::new();

    image.flush_dirty(&mut flash).unwrap();
    assert_eq!(flash.erase_count, 0);
    assert_eq!(flash.program_count, 0);
}

#[test]
fn flush_programs_whole_mirror() {
    let mut image = DiskImage::new();
    let mut flash = RamFlash::new();

    image.file_window_mut()[..5].copy_from_slice(b"hello");
    image.mark_dirty_span(FILE_OFFSET, 5);
    image.flush_dirty(&mut flash).unwrap();

    assert_eq!(flash.erase_count, 1);
    assert_eq!(flash.program_count as usize, IMAGE_SIZE / 2);
    assert_eq!(&flash.contents()[FILE_OFFSET..FILE_OFFSET + 5], b"hello");
    assert!(!image.is_dirty());
}

#[test]
fn erase_failure_keeps_dirty_bits() {
    let mut image = DiskImage::new();
    let mut flash = RamFlash::new();

    image.mark_dirty(0);
    flash.fail_next_erase();
    assert_eq!(image.flush_dirty(&mut flash), Err(FlashError::EraseFailed));
    assert!(image.is_dirty());

    image.flush_dirty(&mut flash).unwrap();
    assert!(!image.is_dirty());
    assert_eq!(flash.erase_count, 1);
}

#[test]
fn load_round_trips_through_flash() {
    let mut image = DiskImage::new();
    let mut flash = RamFlash::new();

    image.root_mut()[..11].copy_from_slice(b"CONFIG  TXT");
    image.mark_all_dirty();
    image.flush_dirty(&mut flash).unwrap();

    let mut reloaded = DiskImage::new();
    reloaded.load_from(&flash);
    assert_eq!(&reloaded.root()[..11], b"CONFIG  TXT");
    assert!(!reloaded.is_dirty());
    assert_eq!(reloaded.buffer[..], image.buffer[..]);
}
