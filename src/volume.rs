//! Volume-level LEB operations: read, write, atomic change, unmap, and the
//! write-failure/WL-move recovery paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{DeviceGeometry, VolumeConfig};
use crate::consolidate::Consolidator;
use crate::device::{IoOutcome, Media, PebIo, Wl};
use crate::eba::EbaTable;
use crate::error::{EbaError, MoveOutcome, Result};
use crate::header::{Vid, VolType};
use crate::leb::{LebDesc, LebIo};
use crate::ltree::LockTree;
use crate::sqnum::SequenceCounter;

struct VolumeState {
    config: VolumeConfig,
    vol_type: VolType,
    table: Mutex<EbaTable>,
    read_only: AtomicBool,
}

/// Owns every volume on one device: the lock tree, the sequence counter,
/// the atomic-change serialization mutex, and each volume's EBA table.
/// Operations take a `vol_id` the way the original driver's functions take
/// a `struct ubi_volume *`.
pub struct EbaDevice<D> {
    geometry: DeviceGeometry,
    device: D,
    sqnum: SequenceCounter,
    ltree: Arc<LockTree>,
    alc_mutex: Mutex<()>,
    /// Held in read mode for the duration of any EBA mapping mutation;
    /// external fastmap snapshotting (out of scope here) would take it in
    /// write mode.
    fm_eba_sem: RwLock<()>,
    volumes: RwLock<HashMap<u32, VolumeState>>,
    /// The consolidator driving each MLC volume, if the embedder registered
    /// one via [`EbaDevice::register_consolidator`]. Consulted after every
    /// successful update so a write that targets a LEB mid-selection can
    /// cancel it (§4.3 `mark_updated`, §4.6 cancellation).
    consolidators: RwLock<HashMap<u32, Arc<Consolidator>>>,
}

impl<D: PebIo + Wl + Media> EbaDevice<D> {
    pub fn new(geometry: DeviceGeometry, device: D) -> Self {
        Self {
            geometry,
            device,
            sqnum: SequenceCounter::new(),
            ltree: LockTree::new(),
            alc_mutex: Mutex::new(()),
            fm_eba_sem: RwLock::new(()),
            volumes: RwLock::new(HashMap::new()),
            consolidators: RwLock::new(HashMap::new()),
        }
    }

    pub fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    /// Register the consolidator driving `vol_id`'s background packing, so
    /// that a user write racing its in-flight selection can cancel it. Not
    /// required for SLC volumes or volumes that never consolidate.
    pub fn register_consolidator(&self, vol_id: u32, consolidator: Arc<Consolidator>) {
        self.consolidators.write().insert(vol_id, consolidator);
    }

    /// Cancel `vol_id`'s in-flight consolidation if it had already selected
    /// `lnum`. A no-op if no consolidator is registered for this volume or
    /// if none is running.
    fn cancel_consolidation_if_targets(&self, vol_id: u32, lnum: u32) {
        if let Some(consolidator) = self.consolidators.read().get(&vol_id) {
            consolidator.cancel_if_targets(lnum);
        }
    }

    /// Register a freshly attached (or newly created) volume with `nlebs`
    /// logical eraseblocks, all initially unmapped.
    pub fn create_volume(&self, config: VolumeConfig, vol_type: VolType, nlebs: u32) {
        let table = EbaTable::new(self.geometry, nlebs, config.reserved_pebs);
        self.volumes.write().insert(
            config.vol_id,
            VolumeState {
                config,
                vol_type,
                table: Mutex::new(table),
                read_only: AtomicBool::new(false),
            },
        );
    }

    /// Install a known mapping for an already-registered volume, used by
    /// attach before any user I/O happens.
    pub fn set_known_mapping(&self, vol_id: u32, lnum: u32, pnum: u32) -> Result<()> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        state.table.lock().set_pnum(lnum, pnum);
        Ok(())
    }

    pub fn count_free_pebs(&self, vol_id: u32) -> Result<u32> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        Ok(state.table.lock().free_pebs())
    }

    pub fn is_mapped(&self, vol_id: u32, lnum: u32) -> Result<bool> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        Ok(state.table.lock().get_ldesc(lnum).is_mapped())
    }

    fn leb_io(&self) -> LebIo<'_, D> {
        LebIo::new(self.geometry, &self.device)
    }

    // ---- narrow surface used by `Consolidator` -----------------------------
    //
    // The consolidator lives in its own module (one instance per volume,
    // driven by a caller-owned loop) and needs a few primitives an
    // `EbaDevice` already has every ingredient for. Keeping these as thin
    // wrappers avoids giving `Consolidator` direct field access while still
    // letting it share the lock tree, sequence counter, and device.

    pub fn next_sqnum(&self) -> u64 {
        self.sqnum.next()
    }

    /// Resume the sequence counter past `highest_seen`, so every sqnum
    /// issued from here on is still strictly greater than anything an
    /// external scan found already persisted on media (I1). Called once by
    /// [`EbaDevice::attach`].
    pub fn resume_sqnum(&self, highest_seen: u64) {
        self.sqnum.ensure_past(highest_seen);
    }

    pub fn acquire_peb(&self) -> Result<u32> {
        self.device.get_peb()
    }

    pub fn release_peb(&self, pnum: u32) -> Result<()> {
        self.device.put_peb(pnum, false)
    }

    pub fn write_marker_header(&self, pnum: u32, vid: Vid) -> Result<()> {
        self.device.write_vid_hdr(pnum, 0, vid)
    }

    pub fn write_vid_hdr_slot(&self, pnum: u32, slot: u32, vid: Vid) -> Result<()> {
        self.device.write_vid_hdr(pnum, slot, vid)
    }

    pub fn leb_io_ref(&self) -> LebIo<'_, D> {
        self.leb_io()
    }

    pub fn get_ldesc(&self, vol_id: u32, lnum: u32) -> Result<LebDesc> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        Ok(state.table.lock().get_ldesc(lnum))
    }

    pub fn try_read_lock(&self, vol_id: u32, lnum: u32) -> Result<crate::ltree::ReadGuard> {
        self.ltree.read_trylock(vol_id, lnum)
    }

    pub fn try_write_lock(&self, vol_id: u32, lnum: u32) -> Result<crate::ltree::WriteGuard> {
        self.ltree.write_trylock(vol_id, lnum)
    }

    pub fn select_consolidation_candidate(&self, vol_id: u32) -> Option<u32> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id)?;
        state.table.lock().select_leb_for_consolidation()
    }

    /// Select the next LEB to fold into a consolidation slot and remove it
    /// from `EbaTable`'s classification lists in the same locked section, so
    /// a concurrent or subsequent call can never select it again while the
    /// first selection is still in flight (I3: each LEB appears in
    /// `lnums[]` at most once).
    pub fn take_consolidation_candidate(&self, vol_id: u32) -> Option<u32> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id)?;
        let mut table = state.table.lock();
        let lnum = table.select_leb_for_consolidation()?;
        table.reserve_for_consolidation(lnum);
        Some(lnum)
    }

    /// Undo `take_consolidation_candidate`: return `lnum` to `open` so it can
    /// be selected again. Called when a consolidation is cancelled or rolled
    /// back after reserving some LEBs but before `install_consolidated`.
    pub fn requeue_consolidation_candidate(&self, vol_id: u32, lnum: u32) {
        let volumes = self.volumes.read();
        let Some(state) = volumes.get(&vol_id) else {
            return;
        };
        state.table.lock().requeue_after_cancel(lnum);
    }

    /// Install a freshly finalized consolidated PEB, returning the PEBs the
    /// participating LEBs used to occupy by themselves so the caller can
    /// return them to WL once this lock is released.
    pub fn install_consolidated(&self, vol_id: u32, lnums: Vec<u32>, pnum: u32) -> Result<Vec<u32>> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        Ok(state.table.lock().install_consolidated(lnums, pnum))
    }

    fn check_not_read_only(&self, state: &VolumeState) -> Result<()> {
        if state.read_only.load(Ordering::Acquire) {
            return Err(EbaError::ReadOnly);
        }
        Ok(())
    }

    fn switch_read_only(&self, state: &VolumeState, vol_id: u32) {
        warn!("vol {vol_id}: switching to read-only after unrecoverable I/O error");
        state.read_only.store(true, Ordering::Release);
    }

    // ---- 4.5.1 read_leb -------------------------------------------------

    pub fn read_leb(
        &self,
        vol_id: u32,
        lnum: u32,
        buf: &mut [u8],
        off: u32,
        check: bool,
    ) -> Result<()> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        let _guard = self.ltree.read_lock(vol_id, lnum);

        let desc = state.table.lock().get_ldesc(lnum);
        if !desc.is_mapped() {
            if state.vol_type == VolType::Static {
                debug_assert!(false, "read from unmapped LEB on a static volume");
            }
            buf.fill(0xFF);
            return Ok(());
        }

        let mut expected: Option<(u32, u32)> = None; // (data_size, data_crc)
        if check {
            let vid = self.device.read_vid_hdr(desc.pnum, desc.lpos.max(0) as u32)?;
            expected = Some((vid.data_size, vid.data_crc));
        }

        let outcome = self.leb_io().read(&desc, off, buf)?;
        if outcome == IoOutcome::BitflipCorrected {
            debug!("vol {vol_id} leb {lnum}: bitflips corrected, scheduling scrub");
            let _ = self.device.scrub_peb(desc.pnum);
        }

        if let Some((data_size, data_crc)) = expected {
            let checked_len = (data_size.saturating_sub(off)).min(buf.len() as u32) as usize;
            let crc = crate::header::UBI_CRC.checksum(&buf[..checked_len]);
            if crc != data_crc {
                return Err(EbaError::BadHeader { pnum: desc.pnum });
            }
        }

        Ok(())
    }

    // ---- 4.5.2 write_leb (dynamic) --------------------------------------

    pub fn write_leb(&self, vol_id: u32, lnum: u32, buf: &[u8], off: u32) -> Result<()> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        self.check_not_read_only(state)?;
        let _fm = self.fm_eba_sem.read();
        let _guard = self.ltree.write_lock(vol_id, lnum);

        let mut desc = state.table.lock().get_ldesc(lnum);

        if desc.is_consolidated() {
            desc = self.unconsolidate_leb(vol_id, state, desc)?;
        }

        if desc.is_mapped() {
            if let Err(err) = self.leb_io().write(&desc, off, buf) {
                debug!("vol {vol_id} leb {lnum}: write failed ({err}), recovering");
                self.recover_peb_locked(vol_id, state, desc, buf, off)?;
            }
            state.table.lock().mark_updated(lnum);
            self.cancel_consolidation_if_targets(vol_id, lnum);
            return Ok(());
        }

        let mut last_err = EbaError::NoSpace;
        for attempt in 0..self.geometry.io_retries {
            let pnum = match self.device.get_peb() {
                Ok(pnum) => pnum,
                Err(err) => return Err(err),
            };
            let vid = Vid {
                vol_type: VolType::Dynamic,
                compat: state.config.compat,
                vol_id,
                lnum,
                data_pad: state.config.data_pad,
                sqnum: self.sqnum.next(),
                ..Default::default()
            };
            if let Err(err) = self.device.write_vid_hdr(pnum, 0, vid) {
                last_err = err;
                let _ = self.device.put_peb(pnum, true);
                continue;
            }
            let new_desc = LebDesc {
                lnum,
                pnum,
                lpos: -1,
            };
            if let Err(err) = self.leb_io().write(&new_desc, off, buf) {
                debug!(
                    "vol {vol_id} leb {lnum}: write attempt {attempt} failed ({err}), retrying"
                );
                last_err = err;
                let _ = self.device.put_peb(pnum, true);
                continue;
            }
            state.table.lock().set_pnum(lnum, pnum);
            state.table.lock().mark_updated(lnum);
            self.cancel_consolidation_if_targets(vol_id, lnum);
            return Ok(());
        }

        self.switch_read_only(state, vol_id);
        Err(last_err)
    }

    fn unconsolidate_leb(
        &self,
        vol_id: u32,
        state: &VolumeState,
        desc: LebDesc,
    ) -> Result<LebDesc> {
        let mut buf = vec![0u8; self.geometry.leb_size as usize];
        self.leb_io().read(&desc, 0, &mut buf)?;

        let pnum = self.device.get_peb()?;
        let vid = Vid {
            vol_type: VolType::Dynamic,
            copy_flag: true,
            compat: state.config.compat,
            vol_id,
            lnum: desc.lnum,
            data_crc: crate::header::UBI_CRC.checksum(&buf),
            data_pad: state.config.data_pad,
            sqnum: self.sqnum.next(),
            ..Default::default()
        };
        self.device.write_vid_hdr(pnum, 0, vid)?;
        let new_desc = LebDesc {
            lnum: desc.lnum,
            pnum,
            lpos: -1,
        };
        self.leb_io().write(&new_desc, 0, &buf)?;

        let outcome = state.table.lock().invalidate(desc.lnum);
        state.table.lock().set_pnum(desc.lnum, pnum);
        if let Some(old_pnum) = outcome.released_peb {
            let _ = self.device.put_peb(old_pnum, false);
        }
        Ok(new_desc)
    }

    // ---- 4.5.3 write_leb_static ------------------------------------------

    pub fn write_leb_static(
        &self,
        vol_id: u32,
        lnum: u32,
        buf: &[u8],
        used_ebs: u32,
    ) -> Result<()> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        self.check_not_read_only(state)?;
        let _fm = self.fm_eba_sem.read();
        let _guard = self.ltree.write_lock(vol_id, lnum);

        let desc = state.table.lock().get_ldesc(lnum);
        debug_assert!(!desc.is_mapped(), "static LEB written more than once");

        let pnum = self.device.get_peb()?;
        let padded_len = buf.len().next_multiple_of(self.geometry.min_io_size as usize);
        let mut padded = vec![0xFFu8; padded_len];
        padded[..buf.len()].copy_from_slice(buf);

        let vid = Vid {
            vol_type: VolType::Static,
            compat: state.config.compat,
            vol_id,
            lnum,
            data_size: buf.len() as u32,
            used_ebs,
            data_pad: state.config.data_pad,
            data_crc: crate::header::UBI_CRC.checksum(buf),
            sqnum: self.sqnum.next(),
            ..Default::default()
        };
        self.device.write_vid_hdr(pnum, 0, vid)?;

        let new_desc = LebDesc {
            lnum,
            pnum,
            lpos: -1,
        };
        self.leb_io().write(&new_desc, 0, &padded)?;
        state.table.lock().set_pnum(lnum, pnum);
        Ok(())
    }

    // ---- 4.5.4 atomic_leb_change ------------------------------------------

    pub fn atomic_leb_change(&self, vol_id: u32, lnum: u32, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            self.unmap_leb(vol_id, lnum)?;
            return self.write_leb(vol_id, lnum, &[], 0);
        }

        let _alc = self.alc_mutex.lock();

        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        self.check_not_read_only(state)?;
        let _fm = self.fm_eba_sem.read();
        let _guard = self.ltree.write_lock(vol_id, lnum);

        let old_desc = state.table.lock().get_ldesc(lnum);

        let pnum = self.device.get_peb()?;
        let vid = Vid {
            vol_type: VolType::Dynamic,
            copy_flag: true,
            compat: state.config.compat,
            vol_id,
            lnum,
            data_crc: crate::header::UBI_CRC.checksum(buf),
            data_pad: state.config.data_pad,
            sqnum: self.sqnum.next(),
            ..Default::default()
        };
        if let Err(err) = self.device.write_vid_hdr(pnum, 0, vid) {
            let _ = self.device.put_peb(pnum, true);
            return Err(err);
        }
        let new_desc = LebDesc {
            lnum,
            pnum,
            lpos: -1,
        };
        if let Err(err) = self.leb_io().write(&new_desc, 0, buf) {
            let _ = self.device.put_peb(pnum, true);
            return Err(err);
        }

        let outcome = state.table.lock().invalidate(lnum);
        debug_assert!(old_desc.is_mapped() == outcome.released_peb.is_some());
        state.table.lock().set_pnum(lnum, pnum);
        state.table.lock().mark_updated(lnum);
        self.cancel_consolidation_if_targets(vol_id, lnum);

        if let Some(old_pnum) = outcome.released_peb {
            let _ = self.device.put_peb(old_pnum, false);
        }
        Ok(())
    }

    // ---- 4.5.6 unmap_leb ---------------------------------------------------

    pub fn unmap_leb(&self, vol_id: u32, lnum: u32) -> Result<()> {
        let volumes = self.volumes.read();
        let state = volumes.get(&vol_id).ok_or(EbaError::InvalidArgument)?;
        self.check_not_read_only(state)?;
        let _fm = self.fm_eba_sem.read();
        let _guard = self.ltree.write_lock(vol_id, lnum);

        let outcome = state.table.lock().invalidate(lnum);
        self.cancel_consolidation_if_targets(vol_id, lnum);
        if let Some(pnum) = outcome.released_peb {
            self.device.put_peb(pnum, false)?;
        }
        Ok(())
    }

    // ---- 4.5.5 recover_peb ---------------------------------------------------

    fn recover_peb_locked(
        &self,
        vol_id: u32,
        state: &VolumeState,
        old_desc: LebDesc,
        buf: &[u8],
        off: u32,
    ) -> Result<()> {
        let leb_size = self.geometry.leb_size as usize;
        let mut merged = vec![0xFFu8; leb_size];
        let prefix_len = (off as usize).min(leb_size);
        if self.leb_io().read(&old_desc, 0, &mut merged[..prefix_len]).is_err() {
            merged[..prefix_len].fill(0xFF);
        }
        let start = off as usize;
        let end = (start + buf.len()).min(leb_size);
        merged[start..end].copy_from_slice(&buf[..end - start]);

        let mut last_err = EbaError::IoFailure {
            pnum: old_desc.pnum,
        };
        for _ in 0..self.geometry.io_retries {
            let pnum = self.device.get_peb()?;
            let vid = Vid {
                vol_type: VolType::Dynamic,
                copy_flag: true,
                compat: state.config.compat,
                vol_id,
                lnum: old_desc.lnum,
                data_crc: crate::header::UBI_CRC.checksum(&merged),
                data_pad: state.config.data_pad,
                sqnum: self.sqnum.next(),
                ..Default::default()
            };
            if let Err(err) = self.device.write_vid_hdr(pnum, 0, vid) {
                last_err = err;
                let _ = self.device.put_peb(pnum, true);
                continue;
            }
            let new_desc = LebDesc {
                lnum: old_desc.lnum,
                pnum,
                lpos: -1,
            };
            if let Err(err) = self.leb_io().write(&new_desc, 0, &merged) {
                last_err = err;
                let _ = self.device.put_peb(pnum, true);
                continue;
            }

            let release = state.table.lock().invalidate(old_desc.lnum);
            state.table.lock().set_pnum(old_desc.lnum, pnum);
            if let Some(released) = release.released_peb {
                let _ = self.device.put_peb(released, true);
            }
            return Ok(());
        }

        self.switch_read_only(state, vol_id);
        Err(last_err)
    }

    // ---- 4.5.7 copy_peb (WL move interface) ---------------------------------

    /// Called by the WL mover while relocating `from` to `to`. Returns a
    /// scheduling signal rather than propagating an error with `?`, since
    /// every outcome except `Succeeded` is routine for the mover.
    pub fn copy_peb(&self, vol_id: u32, lnum: u32, from: u32, to: u32) -> MoveOutcome {
        let volumes = self.volumes.read();
        let state = match volumes.get(&vol_id) {
            Some(s) => s,
            None => return MoveOutcome::CancelRace,
        };

        let _guard = match self.ltree.write_trylock(vol_id, lnum) {
            Ok(guard) => guard,
            Err(_) => return MoveOutcome::Retry,
        };

        let current = state.table.lock().get_ldesc(lnum);
        if current.pnum != from {
            return MoveOutcome::CancelRace;
        }

        let mut buf = vec![0u8; self.geometry.leb_size as usize];
        if self.leb_io().read(&current, 0, &mut buf).is_err() {
            return MoveOutcome::SourceRdErr;
        }

        let data_size = match state.vol_type {
            VolType::Static => match self.device.read_vid_hdr(from, current.lpos.max(0) as u32) {
                Ok(vid) => vid.data_size,
                Err(_) => return MoveOutcome::SourceRdErr,
            },
            VolType::Dynamic => {
                let trimmed = buf.iter().rposition(|&b| b != 0xFF).map_or(0, |p| p + 1);
                trimmed as u32
            }
        };

        let vid = Vid {
            vol_type: state.vol_type,
            copy_flag: true,
            compat: state.config.compat,
            vol_id,
            lnum,
            data_size,
            data_crc: crate::header::UBI_CRC.checksum(&buf[..data_size as usize]),
            data_pad: state.config.data_pad,
            sqnum: self.sqnum.next(),
            consolidated: current.is_consolidated(),
        };
        if self.device.write_vid_hdr(to, current.lpos.max(0) as u32, vid).is_err() {
            return MoveOutcome::TargetWrErr;
        }
        match self.device.read_vid_hdr(to, current.lpos.max(0) as u32) {
            Ok(readback) if readback == vid => {}
            Ok(_) => return MoveOutcome::TargetBitflips,
            Err(_) => return MoveOutcome::TargetRdErr,
        }

        let new_desc = LebDesc {
            lnum,
            pnum: to,
            lpos: current.lpos,
        };
        if self.leb_io().write(&new_desc, 0, &buf).is_err() {
            return MoveOutcome::TargetWrErr;
        }

        if current.is_consolidated() {
            debug!("vol {vol_id} leb {lnum}: consolidated-slot move {from} -> {to} requires eba remap, deferring to caller");
        } else {
            state.table.lock().set_pnum(lnum, to);
        }

        MoveOutcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDevice;

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

    fn dynamic_volume(dev: &EbaDevice<SimDevice>, vol_id: u32, nlebs: u32) {
        dev.create_volume(
            VolumeConfig {
                vol_id,
                reserved_pebs: nlebs,
                alignment: 1,
                data_pad: 0,
                compat: 0,
            },
            VolType::Dynamic,
            nlebs,
        );
    }

    #[test]
    fn write_then_read_dynamic_leb() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);

        dev.write_leb(0, 1, b"hello world", 0).unwrap();
        let mut buf = [0u8; 11];
        dev.read_leb(0, 1, &mut buf, 0, false).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn unmapped_dynamic_leb_reads_as_erased() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);

        let mut buf = [0u8; 16];
        dev.read_leb(0, 2, &mut buf, 0, false).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn unmap_then_read_is_erased_again() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);

        dev.write_leb(0, 0, b"data", 0).unwrap();
        dev.unmap_leb(0, 0).unwrap();
        assert!(!dev.is_mapped(0, 0).unwrap());

        let mut buf = [0u8; 4];
        dev.read_leb(0, 0, &mut buf, 0, false).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn atomic_leb_change_roundtrips() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);

        dev.write_leb(0, 0, b"before", 0).unwrap();
        dev.atomic_leb_change(0, 0, b"after!").unwrap();

        let mut buf = [0u8; 6];
        dev.read_leb(0, 0, &mut buf, 0, false).unwrap();
        assert_eq!(&buf, b"after!");
    }

    #[test]
    fn static_volume_read_checks_crc() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dev.create_volume(
            VolumeConfig {
                vol_id: 1,
                reserved_pebs: 4,
                alignment: 1,
                data_pad: 0,
                compat: 0,
            },
            VolType::Static,
            4,
        );

        dev.write_leb_static(1, 0, b"static payload", 1).unwrap();

        let mut buf = vec![0u8; "static payload".len()];
        dev.read_leb(1, 0, &mut buf, 0, true).unwrap();
        assert_eq!(buf, b"static payload");
    }

    #[test]
    fn copy_peb_move_preserves_contents() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);
        dev.write_leb(0, 0, b"movable", 0).unwrap();

        let from = dev.volumes.read()[&0].table.lock().get_ldesc(0).pnum;
        let to = dev.device.get_peb().unwrap();

        assert_eq!(
            dev.copy_peb(0, 0, from, to),
            MoveOutcome::Succeeded
        );
        assert_eq!(dev.volumes.read()[&0].table.lock().get_ldesc(0).pnum, to);

        let mut buf = [0u8; 7];
        dev.read_leb(0, 0, &mut buf, 0, false).unwrap();
        assert_eq!(&buf, b"movable");
    }

    #[test]
    fn copy_peb_detects_stale_source() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);
        dev.write_leb(0, 0, b"movable", 0).unwrap();

        let bogus_from = 999;
        let to = dev.device.get_peb().unwrap();
        assert_eq!(
            dev.copy_peb(0, 0, bogus_from, to),
            MoveOutcome::CancelRace
        );
    }

    #[test]
    fn copy_peb_retries_without_blocking_under_writer_contention() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);
        dev.write_leb(0, 0, b"movable", 0).unwrap();

        let from = dev.volumes.read()[&0].table.lock().get_ldesc(0).pnum;
        let to = dev.device.get_peb().unwrap();

        let writer_guard = dev.ltree.write_lock(0, 0);
        assert_eq!(dev.copy_peb(0, 0, from, to), MoveOutcome::Retry);
        drop(writer_guard);

        assert_eq!(dev.copy_peb(0, 0, from, to), MoveOutcome::Succeeded);
    }

    #[test]
    fn sqnums_are_strictly_increasing_across_writes() {
        let dev = EbaDevice::new(geometry(1), SimDevice::new(geometry(1), 8));
        dynamic_volume(&dev, 0, 4);

        dev.write_leb(0, 0, b"one", 0).unwrap();
        let first = dev
            .device
            .read_vid_hdr(dev.volumes.read()[&0].table.lock().get_ldesc(0).pnum, 0)
            .unwrap()
            .sqnum;

        dev.write_leb(0, 1, b"two", 0).unwrap();
        let second = dev
            .device
            .read_vid_hdr(dev.volumes.read()[&0].table.lock().get_ldesc(1).pnum, 0)
            .unwrap()
            .sqnum;

        assert!(second > first);
    }
}
