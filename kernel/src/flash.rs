//! Raw flash access by application slot.

use alloc::vec;
use alloc::vec::Vec;

use quartzos_app_proto::{SLOT_COUNT, SLOT_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    NotReady,
    ReadFailed,
}

/// Slot-addressed reads against the external flash part. `offset` is
/// relative to the start of the slot; a read never crosses a slot
/// boundary.
pub trait FlashDriver: Send + Sync {
    fn read(&self, slot: u8, offset: u32, out: &mut [u8]) -> Result<(), FlashError>;
}

/// RAM-backed flash image for simulators and tests. The layout matches
/// the packed image `xtask pack` produces: `SLOT_COUNT` regions of
/// `SLOT_SIZE` bytes, erased bytes reading as 0xFF.
pub struct MemFlash {
    image: Vec<u8>,
}

impl MemFlash {
    pub fn new(image: Vec<u8>) -> Self {
        Self { image }
    }

    /// A fully erased part.
    pub fn blank() -> Self {
        Self {
            image: vec![0xFF; SLOT_COUNT as usize * SLOT_SIZE],
        }
    }

    /// Overwrite the start of `slot` with `bytes`.
    ///
    /// # Panics
    /// Panics when `bytes` exceeds the slot (programming error in the
    /// image being assembled, not a runtime condition).
    pub fn program_slot(&mut self, slot: u8, bytes: &[u8]) {
        assert!(bytes.len() <= SLOT_SIZE, "slot overflow");
        let base = slot as usize * SLOT_SIZE;
        self.image[base..base + bytes.len()].copy_from_slice(bytes);
    }
}

impl FlashDriver for MemFlash {
    fn read(&self, slot: u8, offset: u32, out: &mut [u8]) -> Result<(), FlashError> {
        if slot >= SLOT_COUNT {
            return Err(FlashError::ReadFailed);
        }
        let offset = offset as usize;
        let end = offset.checked_add(out.len()).ok_or(FlashError::ReadFailed)?;
        if end > SLOT_SIZE {
            return Err(FlashError::ReadFailed);
        }
        let base = slot as usize * SLOT_SIZE;
        out.copy_from_slice(&self.image[base + offset..base + end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_part_reads_erased() {
        let flash = MemFlash::blank();
        let mut buf = [0u8; 8];
        flash.read(31, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);
    }

    #[test]
    fn reads_never_cross_a_slot_boundary() {
        let flash = MemFlash::blank();
        let mut buf = [0u8; 16];
        assert_eq!(
            flash.read(0, (SLOT_SIZE - 8) as u32, &mut buf),
            Err(FlashError::ReadFailed)
        );
        assert_eq!(flash.read(SLOT_COUNT, 0, &mut buf), Err(FlashError::ReadFailed));
    }

    #[test]
    fn programmed_bytes_read_back() {
        let mut flash = MemFlash::blank();
        flash.program_slot(3, b"PBLAPP");
        let mut buf = [0u8; 6];
        flash.read(3, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"PBLAPP");
    }
}
