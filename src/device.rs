//! The narrow collaborator traits the EBA core reaches for physical I/O and
//! wear-leveling through, plus an in-memory implementation for tests.
//!
//! Rescoped from the teacher's `Nand`/`NandBlock` block-and-page model
//! (`src/nand/mod.rs`) down to PEB-and-offset granularity: bad-block
//! discovery and low-level page programming belong to the WL/attach layers,
//! which are external collaborators here, not something this crate
//! implements.

use parking_lot::Mutex;

use crate::config::DeviceGeometry;
use crate::error::{EbaError, Result};
use crate::header::Vid;

/// The outcome of a successful read: whether ECC had to correct bitflips.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IoOutcome {
    Clean,
    BitflipCorrected,
}

/// PEB-offset-granular reads and writes, and VID header access.
///
/// `slc_read`/`slc_write` are the "SLC-safe" primitives used for
/// non-consolidated LEBs on MLC media (see `LebIo`); on genuinely SLC media
/// they are identical to `read`/`write`.
pub trait PebIo {
    fn read(&self, pnum: u32, offset: u32, buf: &mut [u8]) -> Result<IoOutcome>;
    fn write(&self, pnum: u32, offset: u32, buf: &[u8]) -> Result<()>;

    fn slc_read(&self, pnum: u32, offset: u32, buf: &mut [u8]) -> Result<IoOutcome> {
        self.read(pnum, offset, buf)
    }

    fn slc_write(&self, pnum: u32, offset: u32, buf: &[u8]) -> Result<()> {
        self.write(pnum, offset, buf)
    }

    fn read_vid_hdr(&self, pnum: u32, slot: u32) -> Result<Vid>;
    fn write_vid_hdr(&self, pnum: u32, slot: u32, vid: Vid) -> Result<()>;

    /// Erase a PEB back to the all-0xFF state. Called by the WL collaborator
    /// before reuse, exposed here only so `SimDevice` can model it; the EBA
    /// core itself never calls this directly.
    fn erase(&self, pnum: u32) -> Result<()>;
}

/// The wear-leveling allocator this crate borrows PEBs from and returns them
/// to. Never implemented by this crate for real media — only by the
/// embedder.
pub trait Wl {
    fn get_peb(&self) -> Result<u32>;
    fn put_peb(&self, pnum: u32, torture: bool) -> Result<()>;
    fn scrub_peb(&self, pnum: u32) -> Result<()>;
}

/// Media geometry facts the EBA core needs but does not compute itself.
pub trait Media {
    fn pairing_groups_per_eb(&self) -> u32;
}

#[derive(Debug, Clone)]
struct PebContents {
    data: Vec<u8>,
    vid_hdrs: Vec<Option<Vid>>,
    erased: bool,
    inject_bitflip: bool,
}

impl PebContents {
    /// A PEB is `leb_start` bytes of header-region padding (left at the
    /// erased fill; `SimDevice` keeps VID headers in `vid_hdrs` instead of
    /// this buffer) followed by `pairing_groups` LEB-sized slots side by
    /// side; on SLC media (`pairing_groups == 1`) this is just one LEB.
    fn new(geometry: &DeviceGeometry) -> Self {
        let capacity =
            geometry.leb_start as usize + geometry.leb_size as usize * geometry.pairing_groups.max(1) as usize;
        Self {
            data: vec![0xFFu8; capacity],
            vid_hdrs: vec![None; geometry.pairing_groups.max(1) as usize],
            erased: true,
            inject_bitflip: false,
        }
    }
}

struct SimDeviceInner {
    pebs: Vec<PebContents>,
    free_pebs: Vec<u32>,
    scrubbed: Vec<u32>,
}

/// An in-memory device implementing [`PebIo`], [`Wl`], and [`Media`], used
/// by every test in this crate in place of real flash. Modeled on the
/// teacher's `SimNand`/`SimBlock` pair.
pub struct SimDevice {
    geometry: DeviceGeometry,
    inner: Mutex<SimDeviceInner>,
}

impl SimDevice {
    /// Create a simulated device with `npebs` physical eraseblocks, all
    /// free and erased.
    pub fn new(geometry: DeviceGeometry, npebs: u32) -> Self {
        let pebs = (0..npebs).map(|_| PebContents::new(&geometry)).collect();
        let free_pebs = (0..npebs).rev().collect();
        Self {
            geometry,
            inner: Mutex::new(SimDeviceInner {
                pebs,
                free_pebs,
                scrubbed: Vec::new(),
            }),
        }
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    /// Test hook: flip a bit the next time `pnum` is read.
    pub fn inject_bitflip(&self, pnum: u32) {
        self.inner.lock().pebs[pnum as usize].inject_bitflip = true;
    }

    /// Test hook: which PEBs were scrubbed via [`Wl::scrub_peb`].
    pub fn scrub_log(&self) -> Vec<u32> {
        self.inner.lock().scrubbed.clone()
    }

    /// Test hook: how many PEBs remain unallocated.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_pebs.len()
    }
}

impl PebIo for SimDevice {
    fn read(&self, pnum: u32, offset: u32, buf: &mut [u8]) -> Result<IoOutcome> {
        let mut inner = self.inner.lock();
        let peb = inner
            .pebs
            .get_mut(pnum as usize)
            .ok_or(EbaError::InvalidArgument)?;

        let start = offset as usize;
        let end = start + buf.len();
        let region = peb
            .data
            .get(start..end)
            .ok_or(EbaError::IoFailure { pnum })?;
        buf.copy_from_slice(region);

        if peb.inject_bitflip {
            peb.inject_bitflip = false;
            buf[0] ^= 0x01;
            return Ok(IoOutcome::BitflipCorrected);
        }
        Ok(IoOutcome::Clean)
    }

    fn write(&self, pnum: u32, offset: u32, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let peb = inner
            .pebs
            .get_mut(pnum as usize)
            .ok_or(EbaError::InvalidArgument)?;

        let start = offset as usize;
        let end = start + buf.len();
        let region = peb
            .data
            .get_mut(start..end)
            .ok_or(EbaError::IoFailure { pnum })?;
        region.copy_from_slice(buf);
        peb.erased = false;
        Ok(())
    }

    fn read_vid_hdr(&self, pnum: u32, slot: u32) -> Result<Vid> {
        let inner = self.inner.lock();
        let peb = inner
            .pebs
            .get(pnum as usize)
            .ok_or(EbaError::InvalidArgument)?;
        peb.vid_hdrs
            .get(slot as usize)
            .and_then(|h| *h)
            .ok_or(EbaError::BadHeader { pnum })
    }

    fn write_vid_hdr(&self, pnum: u32, slot: u32, vid: Vid) -> Result<()> {
        let mut inner = self.inner.lock();
        let peb = inner
            .pebs
            .get_mut(pnum as usize)
            .ok_or(EbaError::InvalidArgument)?;
        let header = peb
            .vid_hdrs
            .get_mut(slot as usize)
            .ok_or(EbaError::InvalidArgument)?;
        *header = Some(vid);
        Ok(())
    }

    fn erase(&self, pnum: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let geometry = self.geometry;
        let peb = inner
            .pebs
            .get_mut(pnum as usize)
            .ok_or(EbaError::InvalidArgument)?;
        *peb = PebContents::new(&geometry);
        Ok(())
    }
}

impl Wl for SimDevice {
    fn get_peb(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        inner.free_pebs.pop().ok_or(EbaError::NoSpace)
    }

    fn put_peb(&self, pnum: u32, torture: bool) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.free_pebs.contains(&pnum) {
                inner.free_pebs.push(pnum);
            }
        }
        if torture {
            self.erase(pnum)?;
        }
        Ok(())
    }

    fn scrub_peb(&self, pnum: u32) -> Result<()> {
        self.inner.lock().scrubbed.push(pnum);
        Ok(())
    }
}

impl Media for SimDevice {
    fn pairing_groups_per_eb(&self) -> u32 {
        self.geometry.pairing_groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(pairing_groups: u32) -> DeviceGeometry {
        DeviceGeometry {
            leb_size: 256,
            min_io_size: 16,
            vid_hdr_offset: 0,
            leb_start: 0,
            pairing_groups,
            eba_reserved_pebs: 1,
            io_retries: 3,
        }
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dev = SimDevice::new(geometry(1), 4);
        let pnum = dev.get_peb().unwrap();
        dev.write(pnum, 0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(dev.read(pnum, 0, &mut buf).unwrap(), IoOutcome::Clean);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn bitflip_is_reported_once() {
        let dev = SimDevice::new(geometry(1), 4);
        let pnum = dev.get_peb().unwrap();
        dev.write(pnum, 0, &[9, 9]).unwrap();
        dev.inject_bitflip(pnum);
        let mut buf = [0u8; 2];
        assert_eq!(
            dev.read(pnum, 0, &mut buf).unwrap(),
            IoOutcome::BitflipCorrected
        );
        assert_eq!(dev.read(pnum, 0, &mut buf).unwrap(), IoOutcome::Clean);
    }

    #[test]
    fn erase_resets_to_all_ff() {
        let dev = SimDevice::new(geometry(1), 4);
        let pnum = dev.get_peb().unwrap();
        dev.write(pnum, 0, &[0, 0, 0]).unwrap();
        dev.erase(pnum).unwrap();
        let mut buf = [0u8; 3];
        dev.read(pnum, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn out_of_pebs_reports_no_space() {
        let dev = SimDevice::new(geometry(1), 1);
        let _pnum = dev.get_peb().unwrap();
        assert!(matches!(dev.get_peb(), Err(EbaError::NoSpace)));
    }
}
