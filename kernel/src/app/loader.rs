//! Dynamic loader: flash bundle in, executable arena image out.
//!
//! Guest binaries are linked position-independent. Their data section
//! holds module-relative offsets, and the bundle's relocation table names
//! every data word that needs the image base added once the load address
//! is known. Code is never patched, only data; the text could in
//! principle stay in flash.

use log::{debug, error};

use quartzos_app_proto::{self as proto, ApplicationHeader};

use crate::app::arena::Arena;
use crate::app::AppError;
use crate::config::MAX_APP_STACK_SIZE;
use crate::flash::FlashDriver;
use crate::port::{HeapRegion, StackRegion};

/// Address of the host's published symbol table, the guest's only
/// discovery mechanism for host services. The loader writes it into the
/// image at the header's `sym_table_addr`; an image without it would jump
/// to zero on its first host call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolTable(usize);

impl SymbolTable {
    pub const fn at_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr(table: *const ()) -> Self {
        Self(table as usize)
    }

    /// Guest pointers are 32 bits wide; on a wider host the low word is
    /// what lands in the image.
    fn as_u32(self) -> u32 {
        self.0 as u32
    }
}

/// A relocated, ready-to-execute guest image.
#[derive(Clone, Copy, Debug)]
pub struct LoadedImage {
    pub header: ApplicationHeader,
    /// Absolute entry address: arena base + header offset.
    pub entry_addr: usize,
    pub heap: HeapRegion,
    pub stack: StackRegion,
}

/// Produce a runnable image of the app in `slot`.
///
/// Fails with `LoadFailed` when the flash part won't deliver the bundle,
/// `TooBig` when the image plus the reserved stack cannot fit the arena,
/// `BadReloc` when a relocation entry points outside the binary, and
/// `InvalidBinary` when the header shape or the binary checksum is wrong.
/// On any failure the arena contents are unspecified and no task may be
/// spawned from it.
pub fn load(
    flash: &dyn FlashDriver,
    slot: u8,
    arena: &mut Arena,
    sym: SymbolTable,
) -> Result<LoadedImage, AppError> {
    // The manifest's cached header may be stale; trust flash, not the scan.
    let mut hdr_buf = [0u8; proto::HEADER_SIZE];
    flash
        .read(slot, 0, &mut hdr_buf)
        .map_err(|_| AppError::LoadFailed)?;
    let header = ApplicationHeader::parse(&hdr_buf).map_err(|_| AppError::LoadFailed)?;

    let app_size = header.app_size as usize;
    let virtual_size = header.virtual_size as usize;
    let reloc_count = header.reloc_entries_count as usize;

    let table_len = reloc_count.checked_mul(4).ok_or(AppError::TooBig)?;
    let image_len = app_size.checked_add(table_len).ok_or(AppError::TooBig)?;
    let footprint = virtual_size
        .checked_add(MAX_APP_STACK_SIZE * 4)
        .ok_or(AppError::TooBig)?;
    if footprint > arena.len() || image_len > arena.len() {
        error!(
            "app: {} does not fit: vsize {:#x} + stack > arena {:#x}",
            header.name(),
            virtual_size,
            arena.len()
        );
        return Err(AppError::TooBig);
    }
    if virtual_size < app_size || (header.offset as usize) >= app_size {
        return Err(AppError::InvalidBinary);
    }

    // Binary and relocation table land at arena offset 0 in one read.
    let dst = arena.bytes_mut(0..image_len).map_err(|_| AppError::TooBig)?;
    flash
        .read(slot, proto::HEADER_SIZE as u32, dst)
        .map_err(|_| AppError::LoadFailed)?;

    let crc = proto::crc32::crc32_ieee(arena.bytes(0..app_size).map_err(|_| AppError::TooBig)?);
    if crc != header.crc {
        error!(
            "app: crc mismatch for {} (slot {}): header {:#010x} computed {:#010x}",
            header.name(),
            slot,
            header.crc,
            crc
        );
        return Err(AppError::InvalidBinary);
    }

    // Relocation: each table entry names a data word (arena byte offset)
    // holding a module-relative value; add the image base and write it
    // back. Entries must stay inside the binary.
    let base = arena.base_addr();
    for i in 0..reloc_count {
        let entry_off = app_size + i * 4;
        let raw = arena
            .bytes(entry_off..entry_off + 4)
            .map_err(|_| AppError::BadReloc)?;
        let got_slot = u32::from_le_bytes(raw.try_into().unwrap_or([0; 4])) as usize;
        if got_slot >= app_size {
            error!(
                "app: reloc {} of {} points outside the binary ({:#x})",
                i,
                header.name(),
                got_slot
            );
            return Err(AppError::BadReloc);
        }
        let index = got_slot / 4;
        let existing = arena.read_word(index).map_err(|_| AppError::BadReloc)?;
        arena
            .patch_word(index, (base as u32).wrapping_add(existing))
            .map_err(|_| AppError::BadReloc)?;
    }

    // BSS is zeroed after relocation; the range also wipes the spent
    // relocation table.
    arena
        .zero_range(app_size..virtual_size)
        .map_err(|_| AppError::TooBig)?;

    // The one point where the host ABI crosses into the guest.
    arena
        .write_bytes(header.sym_table_addr as usize, &sym.as_u32().to_le_bytes())
        .map_err(|_| AppError::InvalidBinary)?;

    log_signature(&header);

    Ok(LoadedImage {
        header,
        entry_addr: base + header.offset as usize,
        heap: arena.heap_region(virtual_size),
        stack: arena.stack_region(),
    })
}

fn log_signature(header: &ApplicationHeader) {
    debug!("app: signature:");
    debug!(
        "app:   sdk {}.{} app {}.{}",
        header.sdk_version.major,
        header.sdk_version.minor,
        header.app_version.major,
        header.app_version.minor
    );
    debug!(
        "app:   name {} company {} icon {}",
        header.name(),
        header.company(),
        header.icon_resource_id
    );
    debug!(
        "app:   size {:#x} entry {:#x} crc {:#010x}",
        header.app_size, header.offset, header.crc
    );
    debug!(
        "app:   sym {:#x} flags {:#x} relocs {} vsize {:#x}",
        header.sym_table_addr, header.flags, header.reloc_entries_count, header.virtual_size
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_APP_MEMORY_SIZE;
    use crate::flash::MemFlash;
    use crate::testutil::{packed_slot, test_arena};
    use quartzos_app_proto::{encode_name, Version, APP_MAGIC};

    fn face_header(app_size: u32, virtual_size: u32) -> ApplicationHeader {
        ApplicationHeader {
            magic: APP_MAGIC,
            sdk_version: Version::new(5, 19),
            app_version: Version::new(1, 0),
            app_size,
            offset: 0x20,
            crc: 0,
            name: encode_name("Tempus"),
            company: encode_name("quartz"),
            icon_resource_id: 0,
            sym_table_addr: 0x10,
            flags: 0,
            reloc_entries_count: 0,
            virtual_size,
        }
    }

    fn flash_with_slot(slot: u8, image: &[u8]) -> MemFlash {
        let mut flash = MemFlash::blank();
        flash.program_slot(slot, image);
        flash
    }

    #[test]
    fn relocates_zeroes_bss_and_installs_symbols() {
        let mut body = vec![0u8; 0x400];
        body[0x100..0x104].copy_from_slice(&0x80u32.to_le_bytes());
        body[0x104..0x108].copy_from_slice(&0x90u32.to_le_bytes());
        let image = packed_slot(&face_header(0x400, 0x500), &body, &[0x100, 0x104]);
        let flash = flash_with_slot(3, &image);
        let mut arena = test_arena(MAX_APP_MEMORY_SIZE);
        let sym = SymbolTable::at_addr(0x0804_2000);

        let loaded = load(&flash, 3, &mut arena, sym).unwrap();

        let base = arena.base_addr() as u32;
        assert_eq!(arena.read_word(0x100 / 4).unwrap(), base.wrapping_add(0x80));
        assert_eq!(arena.read_word(0x104 / 4).unwrap(), base.wrapping_add(0x90));
        assert_eq!(arena.bytes(0x400..0x500).unwrap(), &[0u8; 0x100][..]);
        assert_eq!(
            arena.bytes(0x10..0x14).unwrap(),
            &0x0804_2000u32.to_le_bytes()
        );
        assert_eq!(loaded.entry_addr, arena.base_addr() + 0x20);
        assert_eq!(loaded.heap.base, arena.base_addr() + 0x500);
        assert_eq!(
            loaded.heap.size,
            MAX_APP_MEMORY_SIZE - 0x500 - MAX_APP_STACK_SIZE * 4
        );
        assert_eq!(loaded.stack.words, MAX_APP_STACK_SIZE);
    }

    #[test]
    fn oversize_image_is_rejected_before_touching_the_arena() {
        let body = vec![0u8; 0x40];
        let image = packed_slot(&face_header(0x40, MAX_APP_MEMORY_SIZE as u32), &body, &[]);
        let flash = flash_with_slot(0, &image);
        let mut arena = test_arena(MAX_APP_MEMORY_SIZE);
        arena.write_bytes(0, &[0xA5; 16]).unwrap();

        let err = load(&flash, 0, &mut arena, SymbolTable::at_addr(0)).unwrap_err();
        assert_eq!(err, AppError::TooBig);
        assert_eq!(arena.bytes(0..16).unwrap(), &[0xA5; 16][..]);
    }

    #[test]
    fn relocation_outside_the_binary_fails() {
        let body = vec![0u8; 0x100];
        let image = packed_slot(&face_header(0x100, 0x100), &body, &[0x100]);
        let flash = flash_with_slot(1, &image);
        let mut arena = test_arena(MAX_APP_MEMORY_SIZE);

        let err = load(&flash, 1, &mut arena, SymbolTable::at_addr(0)).unwrap_err();
        assert_eq!(err, AppError::BadReloc);
    }

    #[test]
    fn corrupted_binary_fails_the_checksum() {
        let body = vec![0x11u8; 0x100];
        let mut image = packed_slot(&face_header(0x100, 0x100), &body, &[]);
        image[proto::HEADER_SIZE + 5] ^= 0xFF;
        let flash = flash_with_slot(2, &image);
        let mut arena = test_arena(MAX_APP_MEMORY_SIZE);

        let err = load(&flash, 2, &mut arena, SymbolTable::at_addr(0)).unwrap_err();
        assert_eq!(err, AppError::InvalidBinary);
    }

    #[test]
    fn empty_slot_fails_as_a_load_error() {
        let flash = MemFlash::blank();
        let mut arena = test_arena(MAX_APP_MEMORY_SIZE);
        let err = load(&flash, 9, &mut arena, SymbolTable::at_addr(0)).unwrap_err();
        assert_eq!(err, AppError::LoadFailed);
    }
}
