//! Translating a logical eraseblock into a physical location and dispatching
//! the right flavor of I/O for it.

use crate::config::DeviceGeometry;
use crate::device::{IoOutcome, PebIo};
use crate::error::Result;

/// No PEB is currently mapped for this LEB.
pub const UNMAPPED: u32 = u32::MAX;

/// A LEB's current physical location, valid for the duration of a single
/// operation (callers re-derive it from the [`EbaTable`][crate::eba::EbaTable]
/// whenever they need it fresh).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LebDesc {
    pub lnum: u32,
    pub pnum: u32,
    /// `< 0`: this LEB occupies the whole PEB. `>= 0`: the slot index within
    /// a consolidated PEB.
    pub lpos: i32,
}

impl LebDesc {
    pub fn unmapped(lnum: u32) -> Self {
        Self {
            lnum,
            pnum: UNMAPPED,
            lpos: -1,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.pnum != UNMAPPED
    }

    pub fn is_consolidated(&self) -> bool {
        self.lpos >= 0
    }
}

/// Read/write helpers that know how to turn a [`LebDesc`] plus an in-LEB
/// offset into the right device call.
pub struct LebIo<'a, D: PebIo> {
    geometry: DeviceGeometry,
    device: &'a D,
}

impl<'a, D: PebIo> LebIo<'a, D> {
    pub fn new(geometry: DeviceGeometry, device: &'a D) -> Self {
        Self { geometry, device }
    }

    /// §4.4: `leb_start + loffset` for a whole-PEB LEB, `leb_start + lpos *
    /// leb_size + loffset` for a slot of a consolidated PEB.
    fn slot_offset(&self, desc: &LebDesc) -> u32 {
        let slot_base = if desc.lpos >= 0 {
            desc.lpos as u32 * self.geometry.leb_size
        } else {
            0
        };
        self.geometry.leb_start + slot_base
    }

    /// Read `buf.len()` bytes starting at `off` within the LEB.
    ///
    /// Non-consolidated LEBs go through the SLC-safe primitive even on MLC
    /// media; consolidated slots must use the raw primitive, since SLC-safe
    /// reads assume the whole PEB belongs to one LEB.
    pub fn read(&self, desc: &LebDesc, off: u32, buf: &mut [u8]) -> Result<IoOutcome> {
        let offset = self.slot_offset(desc) + off;
        if desc.is_consolidated() {
            self.device.read(desc.pnum, offset, buf)
        } else {
            self.device.slc_read(desc.pnum, offset, buf)
        }
    }

    pub fn write(&self, desc: &LebDesc, off: u32, buf: &[u8]) -> Result<()> {
        let offset = self.slot_offset(desc) + off;
        if desc.is_consolidated() {
            self.device.write(desc.pnum, offset, buf)
        } else {
            self.device.slc_write(desc.pnum, offset, buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimDevice, Wl};

    fn geometry(pairing_groups: u32) -> DeviceGeometry {
        DeviceGeometry {
            leb_size: 64,
            min_io_size: 8,
            vid_hdr_offset: 0,
            leb_start: 0,
            pairing_groups,
            eba_reserved_pebs: 1,
            io_retries: 3,
        }
    }

    #[test]
    fn whole_peb_leb_reads_back_what_it_wrote() {
        let geo = geometry(1);
        let dev = SimDevice::new(geo, 2);
        let pnum = dev.get_peb().unwrap();
        let io = LebIo::new(geo, &dev);
        let desc = LebDesc {
            lnum: 0,
            pnum,
            lpos: -1,
        };
        io.write(&desc, 0, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        io.read(&desc, 0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn consolidated_slots_do_not_overlap() {
        let geo = geometry(4);
        let dev = SimDevice::new(geo, 2);
        let pnum = dev.get_peb().unwrap();
        let io = LebIo::new(geo, &dev);

        let slot0 = LebDesc {
            lnum: 0,
            pnum,
            lpos: 0,
        };
        let slot1 = LebDesc {
            lnum: 1,
            pnum,
            lpos: 1,
        };

        io.write(&slot0, 0, &[0xAA; 4]).unwrap();
        io.write(&slot1, 0, &[0xBB; 4]).unwrap();

        let mut buf0 = [0u8; 4];
        let mut buf1 = [0u8; 4];
        io.read(&slot0, 0, &mut buf0).unwrap();
        io.read(&slot1, 0, &mut buf1).unwrap();

        assert_eq!(buf0, [0xAA; 4]);
        assert_eq!(buf1, [0xBB; 4]);
    }

    #[test]
    fn leb_start_skips_the_header_region_for_every_slot() {
        let mut geo = geometry(2);
        geo.leb_start = 16; // room for an EC/VID header pair ahead of the data area
        let dev = SimDevice::new(geo, 2);
        let pnum = dev.get_peb().unwrap();
        let io = LebIo::new(geo, &dev);

        let slot0 = LebDesc { lnum: 0, pnum, lpos: 0 };
        let slot1 = LebDesc { lnum: 1, pnum, lpos: 1 };
        io.write(&slot0, 0, &[0xAA; 4]).unwrap();
        io.write(&slot1, 0, &[0xBB; 4]).unwrap();

        // Nothing written before `leb_start`: a raw read at offset 0 (below
        // `leb_start`) must still see the erased fill, not slot 0's data.
        let mut below_header = [0u8; 4];
        dev.read(pnum, 0, &mut below_header).unwrap();
        assert_eq!(below_header, [0xFF; 4]);

        let mut buf0 = [0u8; 4];
        let mut buf1 = [0u8; 4];
        io.read(&slot0, 0, &mut buf0).unwrap();
        io.read(&slot1, 0, &mut buf1).unwrap();
        assert_eq!(buf0, [0xAA; 4]);
        assert_eq!(buf1, [0xBB; 4]);
    }
}
