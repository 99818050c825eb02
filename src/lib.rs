use crate::boot_region::{
    DATA_FIRST_SECTOR, FAT1_FIRST_SECTOR, FAT2_FIRST_SECTOR, ROOT_FIRST_SECTOR, SECTOR_COUNT,
    SECTOR_SIZE,
};
use crate::fat_region::{FIRST_DATA_CLUSTER, MEDIA_SIGNATURE};
use crate::image::{
    DiskImage, FAT1_OFFSET, FAT2_OFFSET, FILE_OFFSET, FILE_WINDOW_SIZE, ROOT_OFFSET,
};
use crate::registry::EntryRegistry;

mod boot_region;
pub mod clock;
mod config_file;
mod fat_region;
mod image;
pub mod flash;
mod registry;
mod root_region;
mod utils;

pub use clock::{Clock, ManualClock};
pub use flash::{Flash, FlashError, RamFlash};
pub use registry::{PrintFn, UpdateFn, ValidateFn, MAX_ENTRIES, MAX_LINE_LEN};

#[cfg(target_endian = "big")]
compile_error!("Big-endian not supported");

/// Sectors of the data area backed by the file window.
pub const FILE_WINDOW_SECTORS: u32 = (FILE_WINDOW_SIZE / SECTOR_SIZE) as u32;

/// Host write bursts quiet for this long are flushed to flash.
const FLASH_WRITE_DELAY_MS: u32 = 500;

#[derive(Debug, PartialEq)]
pub enum WriteError {
    OutOfBounds,
}

/// A 2 MiB FAT12 volume synthesized over a 16 KiB flash-backed image,
/// holding a single editable `CONFIG.TXT`.
///
/// The USB mass-storage transport drives [`read_sector`] and
/// [`write_blocks`]; the application main loop drives [`process`], which
/// is the only place flash I/O happens. The two call sites must not run
/// concurrently — the engine does no locking.
///
/// [`read_sector`]: Self::read_sector
/// [`write_blocks`]: Self::write_blocks
/// [`process`]: Self::process
pub struct VirtualFat12BlockDevice<F, C> {
    image: DiskImage,
    registry: EntryRegistry,
    boot_sector: [u8; SECTOR_SIZE],
    flash: F,
    clock: C,
    pending_flush: bool,
    last_write_ms: u32,
    dot_file_filter: bool,
    initialized: bool,
}

impl<F: Flash, C: Clock> VirtualFat12BlockDevice<F, C> {
    pub fn new(flash: F, clock: C) -> Self {
        Self::new_with_serial_number(flash, clock, rand::random())
    }

    pub fn new_with_serial_number(flash: F, clock: C, volume_serial_number: u32) -> Self {
        Self {
            image: DiskImage::new(),
            registry: EntryRegistry::new(),
            boot_sector: boot_region::build_boot_sector(volume_serial_number),
            flash,
            clock,
            pending_flush: false,
            last_write_ms: 0,
            dot_file_filter: true,
            initialized: false,
        }
    }

    /// Register a configuration entry. Must happen before [`init`]; later
    /// calls are refused. Returns `false` once all slots are taken.
    ///
    /// [`init`]: Self::init
    pub fn register_entry(
        &mut self,
        name: &str,
        default_value: &'static str,
        comment: &str,
        validate: Option<ValidateFn>,
        update: Option<UpdateFn>,
        print: Option<PrintFn>,
    ) -> bool {
        if self.initialized {
            log::warn!("refusing registration of {name:?} after init");
            return false;
        }
        self.registry
            .register(name, default_value, comment, validate, update, print)
    }

    /// Load the persisted image and bring device state and file content in
    /// line: an existing `CONFIG.TXT` is re-validated and re-applied, a
    /// missing one is created from the registered defaults.
    pub fn init(&mut self) {
        self.initialized = true;
        self.image.load_from(&self.flash);
        log::debug!("loaded disk image from flash");

        match root_region::find_config(self.image.root()) {
            Some((index, entry)) => {
                log::debug!(
                    "config file at root index {index}, cluster {}, {} bytes",
                    entry.first_cluster(),
                    entry.file_size()
                );
                if self.revalidate(entry.first_cluster(), index) {
                    self.arm_deferred_flush();
                }
            }
            None => self.create_default_volume(),
        }
    }

    pub fn sector_count(&self) -> u32 {
        SECTOR_COUNT
    }

    pub fn sector_size(&self) -> u32 {
        SECTOR_SIZE as u32
    }

    /// Disable or re-enable the dot-file heuristic of the data-area write
    /// filter. The cluster-2 content check always applies.
    pub fn set_dot_file_filter(&mut self, enabled: bool) {
        self.dot_file_filter = enabled;
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Serve one sector to the host. Touches RAM only.
    pub fn read_sector(&self, sector: u32, buffer: &mut [u8]) {
        assert_eq!(buffer.len(), SECTOR_SIZE);
        buffer.fill(0);

        if sector == 0 {
            log::trace!("reading boot sector");
            buffer.copy_from_slice(&self.boot_sector);
        } else if sector == FAT1_FIRST_SECTOR {
            log::trace!("reading FAT1 sector");
            buffer.copy_from_slice(self.image.fat1());
        } else if sector == FAT2_FIRST_SECTOR {
            log::trace!("reading FAT2 sector");
            buffer.copy_from_slice(self.image.fat2());
        } else if sector == ROOT_FIRST_SECTOR {
            buffer.copy_from_slice(self.image.root());
            if let Some((_, entry)) = root_region::find_config(self.image.root()) {
                log::trace!(
                    "reading root: config at cluster {}, {} bytes",
                    entry.first_cluster(),
                    entry.file_size()
                );
            }
        } else if (DATA_FIRST_SECTOR..DATA_FIRST_SECTOR + FILE_WINDOW_SECTORS).contains(&sector) {
            log::trace!("reading file sector {sector}");
            let offset = (sector - DATA_FIRST_SECTOR) as usize * SECTOR_SIZE;
            buffer.copy_from_slice(&self.image.file_window()[offset..offset + SECTOR_SIZE]);
        } else if sector >= SECTOR_COUNT {
            log::warn!("read of unrecognized sector {sector}");
        }
        // remaining reserved, FAT, root and data sectors read as zeros
    }

    /// Accept `count` sectors from the host, update the image windows, and
    /// arm the deferred flush. Touches RAM only; re-validation runs later
    /// from [`process`].
    ///
    /// [`process`]: Self::process
    pub fn write_blocks(&mut self, sector: u32, count: u32, buffer: &[u8]) -> Result<(), WriteError> {
        assert_eq!(buffer.len(), count as usize * SECTOR_SIZE);

        if u64::from(sector) + u64::from(count) > u64::from(SECTOR_COUNT) {
            return Err(WriteError::OutOfBounds);
        }

        for (index, block) in buffer.chunks_exact(SECTOR_SIZE).enumerate() {
            self.write_sector(sector + index as u32, block);
        }

        self.arm_deferred_flush();
        Ok(())
    }

    /// Deferred-flush pump, called from the application main loop. Once a
    /// write burst has been quiet for [`FLASH_WRITE_DELAY_MS`], the file is
    /// re-validated, normalized, and the image persisted. May block for
    /// the erase-program time of the region.
    pub fn process(&mut self) {
        if !self.pending_flush {
            return;
        }
        if self
            .clock
            .now_ms()
            .wrapping_sub(self.last_write_ms)
            < FLASH_WRITE_DELAY_MS
        {
            return;
        }

        log::trace!("flushing deferred write");
        if let Some((index, entry)) = root_region::find_config(self.image.root()) {
            if entry.file_size() > 0 {
                self.revalidate(entry.first_cluster(), index);
            }
        }

        match self.image.flush_dirty(&mut self.flash) {
            Ok(()) => {
                self.pending_flush = false;
                log::debug!("deferred flash write completed");
            }
            Err(err) => {
                log::error!("deferred flash write failed, will retry: {err:?}");
            }
        }
    }

    fn arm_deferred_flush(&mut self) {
        self.pending_flush = true;
        self.last_write_ms = self.clock.now_ms();
    }

    fn write_sector(&mut self, sector: u32, block: &[u8]) {
        if sector == FAT1_FIRST_SECTOR {
            if block != self.image.fat1() {
                self.image.fat1_mut().copy_from_slice(block);
                self.image.mark_dirty_span(FAT1_OFFSET, SECTOR_SIZE);
            }
        } else if sector == FAT2_FIRST_SECTOR {
            if block != self.image.fat2() {
                self.image.fat2_mut().copy_from_slice(block);
                self.image.mark_dirty_span(FAT2_OFFSET, SECTOR_SIZE);
            }
        } else if sector == ROOT_FIRST_SECTOR {
            if block != self.image.root() {
                self.image.root_mut().copy_from_slice(block);
                self.image.mark_dirty_span(ROOT_OFFSET, SECTOR_SIZE);
                if let Some((_, entry)) = root_region::find_config(self.image.root()) {
                    log::trace!(
                        "host rewrote root: config at cluster {}, {} bytes",
                        entry.first_cluster(),
                        entry.file_size()
                    );
                }
            }
        } else if (DATA_FIRST_SECTOR..SECTOR_COUNT).contains(&sector) {
            let offset = (sector - DATA_FIRST_SECTOR) as usize * SECTOR_SIZE;
            if offset + SECTOR_SIZE > FILE_WINDOW_SIZE {
                return; // beyond the mirrored window
            }
            if !self.accept_data_write(sector, block) {
                return;
            }

            let window = self.image.file_window_mut();
            if block != &window[offset..offset + SECTOR_SIZE] {
                window[offset..offset + SECTOR_SIZE].copy_from_slice(block);
                self.image.mark_dirty_span(FILE_OFFSET + offset, SECTOR_SIZE);
            }
        }
        // all other sectors (secondary FAT/root sectors, reserved area) are
        // served as zeros on read and their writes discarded
    }

    /// Data-area write filter. Hosts reallocate clusters freely and write
    /// speculative shadow files; anything that would clobber the canonical
    /// window without looking like configuration is dropped.
    fn accept_data_write(&self, sector: u32, block: &[u8]) -> bool {
        let write_cluster = (sector - DATA_FIRST_SECTOR) as u16 + FIRST_DATA_CLUSTER;
        let config_cluster = root_region::find_config(self.image.root())
            .map_or(0, |(_, entry)| entry.first_cluster());

        // wherever the host's directory says the file lives is accepted
        if config_cluster > 0 && write_cluster == config_cluster {
            log::trace!("accepting config write to cluster {write_cluster} (sector {sector})");
            return true;
        }

        if write_cluster == FIRST_DATA_CLUSTER {
            if self.registry.matches_any_entry(block) {
                return true;
            }
            log::trace!(
                "rejecting non-config write to cluster 2 (sector {sector}, first byte 0x{:02X})",
                block[0]
            );
            return false;
        }

        if self.dot_file_filter
            && write_cluster <= FIRST_DATA_CLUSTER + FILE_WINDOW_SECTORS as u16
            && self.registry.matches_any_entry(self.image.file_window())
            && looks_like_dot_file(block)
        {
            log::trace!("rejecting dot-file write to cluster {write_cluster} (sector {sector})");
            return false;
        }

        true
    }

    /// Re-parse the host's submission, apply it entry by entry, and
    /// rewrite file window, directory entry and FATs into the canonical
    /// layout. Returns `true` when any entry was rejected or missing.
    fn revalidate(&mut self, src_cluster: u16, dir_index: usize) -> bool {
        let source = self.select_source(src_cluster);
        let lines = config_file::split_lines(&self.image.file_window()[source..]);
        let (illegal, rendered) = config_file::process_entries(&mut self.registry, &lines);

        let window = self.image.file_window_mut();
        let length = config_file::write_file(&self.registry, &rendered, window);
        window[length..].fill(0);
        log::trace!("rebuilt config file, {length} bytes");

        root_region::normalize_config(self.image.root_mut(), dir_index, length as u32);
        fat_region::rebuild_chain(self.image.fat1_mut(), length as u32);
        self.image.sync_fats();

        self.image.mark_dirty_span(FAT1_OFFSET, FILE_OFFSET);
        self.image.mark_dirty_span(FILE_OFFSET, length.max(1));

        illegal
    }

    /// Decide where to read the host's submission from: the cluster its
    /// directory entry points at, else the previously normalized window,
    /// else flash. The engine serves reads from the normalized window, but
    /// a fresh write lands wherever the host allocated it.
    fn select_source(&mut self, src_cluster: u16) -> usize {
        let in_window =
            (FIRST_DATA_CLUSTER..FIRST_DATA_CLUSTER + FILE_WINDOW_SECTORS as u16)
                .contains(&src_cluster);
        let host_offset = if in_window {
            usize::from(src_cluster - FIRST_DATA_CLUSTER) * SECTOR_SIZE
        } else {
            0
        };

        if self
            .registry
            .matches_any_entry(&self.image.file_window()[host_offset..])
        {
            log::trace!("reading config from the host's cluster {src_cluster}");
            return host_offset;
        }
        if self.registry.matches_any_entry(self.image.file_window()) {
            log::trace!("reading config from the normalized window");
            return 0;
        }

        log::warn!("no parseable config in RAM, reloading the data window from flash");
        self.flash.read(FILE_OFFSET, self.image.file_window_mut());
        if self.registry.matches_any_entry(self.image.file_window()) {
            log::debug!("recovered config from flash");
            0
        } else {
            log::trace!("flash holds no config either, falling back to defaults");
            host_offset
        }
    }

    /// Fresh-volume path: synthesize directory entry, FATs and file
    /// content from the registered defaults.
    fn create_default_volume(&mut self) {
        log::info!("volume has no config file, creating one from defaults");

        self.image.fill_zero();

        let rendered = config_file::default_lines(&self.registry);
        let window = self.image.file_window_mut();
        let length = config_file::write_file(&self.registry, &rendered, window);

        root_region::write_entry(
            self.image.root_mut(),
            0,
            &root_region::DirectoryEntry::config_file(length as u32),
        );

        let fat1 = self.image.fat1_mut();
        fat1[..MEDIA_SIGNATURE.len()].copy_from_slice(&MEDIA_SIGNATURE);
        fat_region::rebuild_chain(fat1, length as u32);
        self.image.sync_fats();

        self.image.mark_all_dirty();
        self.arm_deferred_flush();
    }
}

fn looks_like_dot_file(block: &[u8]) -> bool {
    // 0x00: resource-fork padding; 0x05: deleted-entry sentinel;
    // '.' with a second byte: `._*` shadow-file content
    block[0] == 0x00 || block[0] == 0x05 || (block[0] == b'.' && block[1] != 0)
}

#[cfg(test)]
use std::cell::{Cell, RefCell};
#[cfg(test)]
use std::rc::Rc;

#[cfg(test)]
type TestDevice = VirtualFat12BlockDevice<RamFlash, ManualClock>;

#[cfg(test)]
fn test_device() -> (TestDevice, ManualClock) {
    let clock = ManualClock::new();
    let device = VirtualFat12BlockDevice::new_with_serial_number(RamFlash::new(), clock.clone(), 0);
    (device, clock)
}

#[cfg(test)]
fn sector_with(content: &[u8]) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    sector[..content.len()].copy_from_slice(content);
    sector
}

#[cfg(test)]
struct Brightness {
    state: Rc<Cell<u32>>,
    updates: Rc<RefCell<Vec<String>>>,
}

/// `brightness` entry with validator (0..=100), recording updater, and a
/// printer rendering live state.
#[cfg(test)]
fn register_brightness(device: &mut TestDevice) -> Brightness {
    let state = Rc::new(Cell::new(50u32));
    let updates: Rc<RefCell<Vec<String>>> = Rc::default();

    let update_state = state.clone();
    let update_log = updates.clone();
    let print_state = state.clone();

    assert!(device.register_entry(
        "brightness",
        "50",
        "#(0~100)",
        Some(Box::new(|value: &[u8]| {
            std::str::from_utf8(value)
                .ok()
                .and_then(|text| text.parse::<u32>().ok())
                .map_or(false, |level| level <= 100)
        })),
        Some(Box::new(move |value: &[u8]| {
            let text = String::from_utf8_lossy(value).into_owned();
            if let Ok(level) = text.parse() {
                update_state.set(level);
            }
            update_log.borrow_mut().push(text);
        })),
        Some(Box::new(move |buffer: &mut [u8]| {
            let line = format!("brightness={}", print_state.get());
            buffer[..line.len()].copy_from_slice(line.as_bytes());
            line.len()
        })),
    ));

    Brightness { state, updates }
}

#[test]
fn fresh_flash_creates_default_volume() {
    let (mut device, clock) = test_device();
    let brightness = register_brightness(&mut device);
    device.init();

    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(32, &mut sector);
    assert_eq!(&sector[..11], b"CONFIG  TXT");
    assert_eq!(&sector[26..28], &[0x02, 0x00]); // starting cluster 2
    assert_eq!(&sector[28..32], &24u32.to_le_bytes());

    device.read_sector(64, &mut sector);
    assert_eq!(&sector[..24], b"brightness=50\t#(0~100)\r\n");
    assert!(sector[24..].iter().all(|&byte| byte == 0));

    device.read_sector(8, &mut sector);
    assert_eq!(&sector[..6], &[0xF8, 0xFF, 0xFF, 0xFF, 0x0F, 0x00]);
    let mut fat2 = [0u8; SECTOR_SIZE];
    device.read_sector(20, &mut fat2);
    assert_eq!(sector, fat2);

    device.read_sector(0, &mut sector);
    assert_eq!(&sector[43..54], b"RAMDISK    ");
    assert_eq!(&sector[54..62], b"FAT12   ");
    assert_eq!(&sector[510..], &[0x55, 0xAA]);

    // defaults render without invoking callbacks, and nothing hits flash
    // before the deferred flush fires
    assert!(brightness.updates.borrow().is_empty());
    assert_eq!(device.flash().erase_count, 0);

    clock.advance(600);
    device.process();
    assert_eq!(device.flash().erase_count, 1);
    assert_eq!(
        &device.flash().contents()[FILE_OFFSET..FILE_OFFSET + 24],
        b"brightness=50\t#(0~100)\r\n"
    );
}

#[test]
fn reserved_and_unbacked_sectors_read_zero() {
    let (mut device, _clock) = test_device();
    register_brightness(&mut device);
    device.init();

    for sector_index in [1, 7, 9, 19, 21, 31, 33, 63, 64 + FILE_WINDOW_SECTORS, 4095, 5000] {
        let mut sector = [0xAAu8; SECTOR_SIZE];
        device.read_sector(sector_index, &mut sector);
        assert!(sector.iter().all(|&byte| byte == 0), "sector {sector_index}");
    }
}

#[test]
fn valid_edit_applies_update_and_persists() {
    let (mut device, clock) = test_device();
    let brightness = register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();

    device
        .write_blocks(64, 1, &sector_with(b"brightness=75\t#(0~100)\r\n"))
        .unwrap();
    clock.advance(600);
    device.process();

    assert_eq!(
        brightness.updates.borrow().as_slice(),
        &["50".to_string(), "75".to_string()]
    );
    assert_eq!(brightness.state.get(), 75);
    assert_eq!(device.flash().erase_count, 2);
    assert_eq!(
        &device.flash().contents()[FILE_OFFSET..FILE_OFFSET + 24],
        b"brightness=75\t#(0~100)\r\n"
    );

    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(64, &mut sector);
    assert_eq!(&sector[..24], b"brightness=75\t#(0~100)\r\n");
    device.read_sector(32, &mut sector);
    assert_eq!(&sector[28..32], &24u32.to_le_bytes());
}

#[test]
fn rejected_edit_restores_default() {
    let (mut device, clock) = test_device();
    let brightness = register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();

    device
        .write_blocks(64, 1, &sector_with(b"brightness=999\t#(0~100)\r\n"))
        .unwrap();
    clock.advance(600);
    device.process();

    // the rejected value never reached the updater
    assert_eq!(brightness.updates.borrow().as_slice(), &["50".to_string()]);
    assert_eq!(brightness.state.get(), 50);

    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(64, &mut sector);
    assert_eq!(&sector[..24], b"brightness=50\t#(0~100)\r\n");
    assert!(sector[24..].iter().all(|&byte| byte == 0));
    assert_eq!(device.flash().erase_count, 2);
}

#[test]
fn dot_file_probes_are_rejected() {
    let (mut device, clock) = test_device();
    register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();

    // deleted-entry sentinel trying to reuse cluster 2
    let mut probe = [0u8; SECTOR_SIZE];
    probe[0] = 0x05;
    probe[1..8].copy_from_slice(b"CONFIG ");
    device.write_blocks(64, 1, &probe).unwrap();

    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(64, &mut sector);
    assert_eq!(&sector[..24], b"brightness=50\t#(0~100)\r\n");

    // resource-fork padding and `._*` content at cluster 3
    let mut fork = [0u8; SECTOR_SIZE];
    fork[1] = 0xAB;
    device.write_blocks(65, 1, &fork).unwrap();
    device.read_sector(65, &mut sector);
    assert!(sector.iter().all(|&byte| byte == 0));

    let shadow = sector_with(b"._CONFIG.TXT resource fork");
    device.write_blocks(65, 1, &shadow).unwrap();
    device.read_sector(65, &mut sector);
    assert!(sector.iter().all(|&byte| byte == 0));

    // with the heuristic opted out the same write lands
    device.set_dot_file_filter(false);
    device.write_blocks(65, 1, &shadow).unwrap();
    device.read_sector(65, &mut sector);
    assert_eq!(sector, shadow);
}

#[test]
fn host_reallocated_cluster_is_normalized() {
    let (mut device, clock) = test_device();
    let brightness = register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();

    // host rewrites the root entry to point at cluster 5...
    let mut root = [0u8; SECTOR_SIZE];
    device.read_sector(32, &mut root);
    root[26] = 5;
    device.write_blocks(32, 1, &root).unwrap();

    // ...and writes the edited file there (sector 67 = cluster 5)
    device
        .write_blocks(67, 1, &sector_with(b"brightness=80\t#(0~100)\r\n"))
        .unwrap();
    clock.advance(600);
    device.process();

    assert_eq!(brightness.state.get(), 80);
    assert_eq!(brightness.updates.borrow().last().unwrap(), "80");

    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(32, &mut sector);
    assert_eq!(&sector[26..28], &[0x02, 0x00]); // forced back to cluster 2
    assert_eq!(&sector[28..32], &24u32.to_le_bytes());

    device.read_sector(64, &mut sector);
    assert_eq!(&sector[..24], b"brightness=80\t#(0~100)\r\n");
    device.read_sector(67, &mut sector);
    assert!(sector.iter().all(|&byte| byte == 0));
}

#[test]
fn burst_writes_coalesce_into_one_flush() {
    let (mut device, clock) = test_device();
    let brightness = register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();
    assert_eq!(device.flash().erase_count, 1);

    let mut fat1 = [0u8; SECTOR_SIZE];
    let mut fat2 = [0u8; SECTOR_SIZE];
    let mut root = [0u8; SECTOR_SIZE];
    device.read_sector(8, &mut fat1);
    device.read_sector(20, &mut fat2);
    device.read_sector(32, &mut root);

    device.write_blocks(64, 1, &sector_with(b"brightness=75\t#(0~100)\r\n")).unwrap();
    clock.advance(10);
    device.write_blocks(8, 1, &fat1).unwrap();
    clock.advance(10);
    device.write_blocks(20, 1, &fat2).unwrap();
    clock.advance(10);
    device.write_blocks(32, 1, &root).unwrap();

    clock.advance(400);
    device.process(); // 400 ms since the last write: too early
    assert_eq!(device.flash().erase_count, 1);

    clock.advance(200);
    device.process();
    assert_eq!(device.flash().erase_count, 2);
    assert_eq!(
        brightness.updates.borrow().as_slice(),
        &["50".to_string(), "75".to_string()]
    );
}

#[test]
fn fats_stay_mirrored_after_host_garbage() {
    let (mut device, clock) = test_device();
    register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();

    let mut junk = [0u8; SECTOR_SIZE];
    junk[..3].copy_from_slice(&[0xF8, 0xFF, 0xFF]);
    junk[100] = 0xAA;
    device.write_blocks(8, 1, &junk).unwrap();
    clock.advance(600);
    device.process();

    let mut fat1 = [0u8; SECTOR_SIZE];
    let mut fat2 = [0u8; SECTOR_SIZE];
    device.read_sector(8, &mut fat1);
    device.read_sector(20, &mut fat2);
    assert_eq!(fat1, fat2);
    assert_eq!(&fat1[..6], &[0xF8, 0xFF, 0xFF, 0xFF, 0x0F, 0x00]);
    assert_eq!(fat1[100], 0);
}

#[test]
fn init_is_idempotent() {
    let (mut device, clock) = test_device();
    register_brightness(&mut device);
    device.init();

    let snapshot = |device: &TestDevice| {
        let mut sectors = Vec::new();
        for sector_index in [8u32, 20, 32, 64] {
            let mut sector = [0u8; SECTOR_SIZE];
            device.read_sector(sector_index, &mut sector);
            sectors.extend_from_slice(&sector);
        }
        sectors
    };

    let first = snapshot(&device);
    device.init();
    assert_eq!(snapshot(&device), first);

    clock.advance(600);
    device.process();
    device.init();
    assert_eq!(snapshot(&device), first);
}

#[test]
fn late_registration_is_refused() {
    let (mut device, _clock) = test_device();
    register_brightness(&mut device);
    device.init();

    assert!(!device.register_entry("late", "1", "#", None, None, None));
}

#[test]
fn out_of_bounds_writes_are_reported() {
    let (mut device, _clock) = test_device();
    register_brightness(&mut device);
    device.init();

    assert_eq!(
        device.write_blocks(4096, 1, &[0u8; SECTOR_SIZE]),
        Err(WriteError::OutOfBounds)
    );
    assert_eq!(
        device.write_blocks(4095, 2, &[0u8; 2 * SECTOR_SIZE]),
        Err(WriteError::OutOfBounds)
    );

    // in-bounds but beyond the mirrored window: quietly discarded
    device
        .write_blocks(4095, 1, &sector_with(b"brightness=1"))
        .unwrap();
    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(4095, &mut sector);
    assert!(sector.iter().all(|&byte| byte == 0));
}

#[test]
fn parse_slot_boundary() {
    let (mut device, clock) = test_device();
    let seen = Rc::new(Cell::new(0usize));
    let sink = seen.clone();
    assert!(device.register_entry(
        "key",
        "0",
        "#",
        Some(Box::new(move |value: &[u8]| {
            sink.set(value.len());
            true
        })),
        None,
        None,
    ));
    device.init();

    // a line of exactly MAX_LINE_LEN bytes parses without truncation
    let mut content = b"key=".to_vec();
    content.resize(MAX_LINE_LEN, b'v');
    content.extend_from_slice(b"\r\n");
    let mut blocks = vec![0u8; 5 * SECTOR_SIZE];
    blocks[..content.len()].copy_from_slice(&content);
    device.write_blocks(64, 5, &blocks).unwrap();
    clock.advance(600);
    device.process();
    assert_eq!(seen.get(), MAX_LINE_LEN - 4);

    // one byte longer: the final byte is clipped
    let mut content = b"key=".to_vec();
    content.resize(MAX_LINE_LEN + 1, b'v');
    content.extend_from_slice(b"\r\n");
    let mut blocks = vec![0u8; 5 * SECTOR_SIZE];
    blocks[..content.len()].copy_from_slice(&content);
    device.write_blocks(64, 5, &blocks).unwrap();
    clock.advance(600);
    device.process();
    assert_eq!(seen.get(), MAX_LINE_LEN - 4);
}

#[test]
fn unknown_lines_are_ignored() {
    let (mut device, clock) = test_device();
    let brightness = register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();

    device
        .write_blocks(
            64,
            1,
            &sector_with(b"brightness=75\t#(0~100)\r\nunknown=9\r\n"),
        )
        .unwrap();
    clock.advance(600);
    device.process();

    assert_eq!(brightness.state.get(), 75);
    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(64, &mut sector);
    assert_eq!(&sector[..24], b"brightness=75\t#(0~100)\r\n");
    assert!(sector[24..].iter().all(|&byte| byte == 0));
}

#[test]
fn printerless_entry_applies_value_but_renders_default() {
    let (mut device, clock) = test_device();
    let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let sink = seen.clone();
    assert!(device.register_entry(
        "token",
        "none",
        "#secret",
        None,
        Some(Box::new(move |value: &[u8]| sink.borrow_mut().push(value.to_vec()))),
        None,
    ));
    device.init();
    clock.advance(600);
    device.process();

    device
        .write_blocks(64, 1, &sector_with(b"token=abc123\t#secret\r\n"))
        .unwrap();
    clock.advance(600);
    device.process();

    assert!(seen.borrow().contains(&b"abc123".to_vec()));
    let mut sector = [0u8; SECTOR_SIZE];
    device.read_sector(64, &mut sector);
    assert_eq!(&sector[..20], b"token=none\t#secret\r\n");
}

#[test]
fn erase_failure_retries_on_next_process() {
    let (mut device, clock) = test_device();
    register_brightness(&mut device);
    device.init();
    clock.advance(600);
    device.process();
    assert_eq!(device.flash().erase_count, 1);

    device
        .write_blocks(64, 1, &sector_with(b"brightness=75\t#(0~100)\r\n"))
        .unwrap();
    device.flash_mut().fail_next_erase();
    clock.advance(600);
    device.process();

    // the cycle aborted; flash still holds the old content
    assert_eq!(device.flash().erase_count, 1);
    assert_eq!(
        &device.flash().contents()[FILE_OFFSET..FILE_OFFSET + 24],
        b"brightness=50\t#(0~100)\r\n"
    );

    device.process();
    assert_eq!(device.flash().erase_count, 2);
    assert_eq!(
        &device.flash().contents()[FILE_OFFSET..FILE_OFFSET + 24],
        b"brightness=75\t#(0~100)\r\n"
    );
}
