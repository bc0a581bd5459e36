//! The MLC consolidation engine: packs several logical eraseblocks into one
//! physical eraseblock, cooperatively cancellable by any writer that
//! targets a LEB mid-selection.

use log::debug;
use parking_lot::Mutex;

use crate::device::{Media, PebIo, Wl};
use crate::error::{EbaError, Result};
use crate::header::{Vid, VolType};
use crate::leb::{LebDesc, UNMAPPED};
use crate::volume::EbaDevice;

/// Where a volume's consolidator currently sits.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConsolidationState {
    Idle,
    Selecting,
    Copying,
    Finalizing,
}

struct Session {
    state: ConsolidationState,
    dest_pnum: u32,
    lnums: Vec<u32>,
    loffset: u32,
    slot_idx: usize,
    cancel: bool,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: ConsolidationState::Idle,
            dest_pnum: UNMAPPED,
            lnums: Vec::new(),
            loffset: 0,
            slot_idx: 0,
            cancel: false,
        }
    }
}

/// Return every LEB this session had already reserved (via
/// `take_consolidation_candidate`) to `open`, so a later consolidation
/// attempt can select them again. Called whenever a session is torn down
/// before `install_consolidated` runs.
fn requeue_reserved<D: PebIo + Wl + Media>(device: &EbaDevice<D>, vol_id: u32, lnums: &[u32]) {
    for &lnum in lnums {
        if lnum != UNMAPPED {
            device.requeue_consolidation_candidate(vol_id, lnum);
        }
    }
}

/// Drives one volume's consolidation state machine. Owns no threads: a
/// caller-owned loop (outside this crate) calls `step` repeatedly and acts
/// on the result, the same way the teacher's own scanning/formatting code
/// is driven by a caller loop rather than a background task it spawns
/// itself.
pub struct Consolidator {
    vol_id: u32,
    session: Mutex<Session>,
}

/// What happened during one call to [`Consolidator::step`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepOutcome {
    /// Nothing to do right now.
    Idle,
    /// Made progress; call `step` again.
    Again,
    /// A source LEB was contended; this round is deferred.
    Busy,
    /// A full consolidation finished this call.
    Finished,
    /// The in-flight consolidation was cancelled.
    Cancelled,
}

impl Consolidator {
    pub fn new(vol_id: u32) -> Self {
        Self {
            vol_id,
            session: Mutex::new(Session::idle()),
        }
    }

    pub fn state(&self) -> ConsolidationState {
        self.session.lock().state
    }

    /// Mark the in-flight selection as cancelled. Called by `EbaDevice`
    /// write paths (via [`Consolidator::cancel_if_targets`]) when a user
    /// write races a LEB the consolidator had already selected.
    pub fn cancel_if_targets(&self, lnum: u32) {
        let mut session = self.session.lock();
        if session.state != ConsolidationState::Idle && session.lnums.contains(&lnum) {
            session.cancel = true;
        }
    }

    /// Is consolidation even possible right now (enough candidates to fill
    /// a PEB, and a session not already in flight)?
    pub fn consolidation_possible<D: PebIo + Wl + Media>(&self, device: &EbaDevice<D>) -> bool {
        device.geometry().is_mlc()
            && self.state() == ConsolidationState::Idle
            && device.select_consolidation_candidate(self.vol_id).is_some()
    }

    /// Run one step of the state machine.
    pub fn step<D: PebIo + Wl + Media>(&self, device: &EbaDevice<D>) -> Result<StepOutcome> {
        let current_state = self.state();
        match current_state {
            ConsolidationState::Idle => self.start(device),
            ConsolidationState::Selecting | ConsolidationState::Copying => self.copy_step(device),
            ConsolidationState::Finalizing => self.finalize(device),
        }
    }

    fn start<D: PebIo + Wl + Media>(&self, device: &EbaDevice<D>) -> Result<StepOutcome> {
        let pairing_groups = device.geometry().pairing_groups.max(1) as usize;
        let dest_pnum = match device.acquire_peb() {
            Ok(pnum) => pnum,
            Err(EbaError::NoSpace) => return Ok(StepOutcome::Idle),
            Err(err) => return Err(err),
        };

        let marker = Vid {
            vol_type: VolType::Dynamic,
            consolidated: true,
            sqnum: device.next_sqnum(),
            vol_id: self.vol_id,
            ..Default::default()
        };
        if let Err(err) = device.write_marker_header(dest_pnum, marker) {
            let _ = device.release_peb(dest_pnum);
            return Err(err);
        }

        let mut session = self.session.lock();
        *session = Session {
            state: ConsolidationState::Selecting,
            dest_pnum,
            lnums: vec![UNMAPPED; pairing_groups],
            loffset: 0,
            slot_idx: 0,
            cancel: false,
        };
        debug!(
            "vol {}: consolidation selecting into peb {dest_pnum}",
            self.vol_id
        );
        Ok(StepOutcome::Again)
    }

    fn copy_step<D: PebIo + Wl + Media>(&self, device: &EbaDevice<D>) -> Result<StepOutcome> {
        let leb_size = device.geometry().leb_size;

        let mut session = self.session.lock();
        if session.cancel {
            let dest_pnum = session.dest_pnum;
            let reserved = std::mem::take(&mut session.lnums);
            *session = Session::idle();
            drop(session);
            requeue_reserved(device, self.vol_id, &reserved);
            device.release_peb(dest_pnum)?;
            return Ok(StepOutcome::Cancelled);
        }

        if session.loffset == 0 && session.lnums[session.slot_idx] == UNMAPPED {
            let candidate = match device.take_consolidation_candidate(self.vol_id) {
                Some(lnum) => lnum,
                None => {
                    let dest_pnum = session.dest_pnum;
                    let reserved = std::mem::take(&mut session.lnums);
                    *session = Session::idle();
                    drop(session);
                    requeue_reserved(device, self.vol_id, &reserved);
                    device.release_peb(dest_pnum)?;
                    return Ok(StepOutcome::Idle);
                }
            };
            session.lnums[session.slot_idx] = candidate;
        }

        let lnum = session.lnums[session.slot_idx];
        let slot_idx = session.slot_idx;
        let dest_pnum = session.dest_pnum;
        let loffset = session.loffset;
        let min_io = device.geometry().min_io_size;
        drop(session);

        let guard = match device.try_read_lock(self.vol_id, lnum) {
            Ok(guard) => guard,
            Err(_) => return Ok(StepOutcome::Busy),
        };

        let chunk_len = min_io.min(leb_size - loffset);
        let mut chunk = vec![0u8; chunk_len as usize];
        let src_desc = device.get_ldesc(self.vol_id, lnum)?;
        device.leb_io_ref().read(&src_desc, loffset, &mut chunk)?;
        drop(guard);

        let dest_desc = LebDesc {
            lnum,
            pnum: dest_pnum,
            lpos: slot_idx as i32,
        };
        device.leb_io_ref().write(&dest_desc, loffset, &chunk)?;

        let mut session = self.session.lock();
        session.loffset += chunk_len;
        if session.loffset >= leb_size {
            session.loffset = 0;
            session.slot_idx += 1;
        }

        if session.slot_idx >= session.lnums.len() {
            session.state = ConsolidationState::Finalizing;
            return Ok(StepOutcome::Again);
        }

        session.state = ConsolidationState::Copying;
        Ok(StepOutcome::Again)
    }

    fn finalize<D: PebIo + Wl + Media>(&self, device: &EbaDevice<D>) -> Result<StepOutcome> {
        let (dest_pnum, lnums) = {
            let session = self.session.lock();
            (session.dest_pnum, session.lnums.clone())
        };

        let mut guards = Vec::new();
        for &lnum in &lnums {
            if lnum == UNMAPPED {
                continue;
            }
            match device.try_write_lock(self.vol_id, lnum) {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    drop(guards);
                    return Ok(StepOutcome::Busy);
                }
            }
        }

        if self.session.lock().cancel {
            drop(guards);
            let (dest_pnum, reserved) = {
                let mut session = self.session.lock();
                let pnum = session.dest_pnum;
                let reserved = std::mem::take(&mut session.lnums);
                *session = Session::idle();
                (pnum, reserved)
            };
            requeue_reserved(device, self.vol_id, &reserved);
            device.release_peb(dest_pnum)?;
            return Ok(StepOutcome::Cancelled);
        }

        for (slot_idx, &lnum) in lnums.iter().enumerate() {
            if lnum == UNMAPPED {
                continue;
            }
            let vid = Vid {
                vol_type: VolType::Dynamic,
                consolidated: true,
                vol_id: self.vol_id,
                lnum,
                sqnum: device.next_sqnum(),
                ..Default::default()
            };
            device.write_vid_hdr_slot(dest_pnum, slot_idx as u32, vid)?;
        }

        let vacated_pebs = device.install_consolidated(self.vol_id, lnums, dest_pnum)?;
        drop(guards);

        for pnum in vacated_pebs {
            device.release_peb(pnum)?;
        }

        *self.session.lock() = Session::idle();
        debug!("vol {}: consolidation into peb {dest_pnum} finished", self.vol_id);
        Ok(StepOutcome::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceGeometry, VolumeConfig};
    use crate::device::SimDevice;
    use crate::header::VolType;
    use crate::volume::EbaDevice;

    fn geometry() -> DeviceGeometry {
        DeviceGeometry {
            leb_size: 32,
            min_io_size: 8,
            vid_hdr_offset: 0,
            leb_start: 0,
            pairing_groups: 4,
            eba_reserved_pebs: 1,
            io_retries: 3,
        }
    }

    fn run_to_completion<D: PebIo + Wl + Media>(
        consolidator: &Consolidator,
        device: &EbaDevice<D>,
    ) -> StepOutcome {
        loop {
            match consolidator.step(device).unwrap() {
                StepOutcome::Again | StepOutcome::Busy => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn consolidates_four_open_lebs_into_one_peb() {
        let geo = geometry();
        let dev = EbaDevice::new(geo, SimDevice::new(geo, 16));
        dev.create_volume(
            VolumeConfig {
                vol_id: 0,
                reserved_pebs: 8,
                alignment: 1,
                data_pad: 0,
                compat: 0,
            },
            VolType::Dynamic,
            8,
        );
        for lnum in 0..4 {
            dev.write_leb(0, lnum, &[lnum as u8; 32], 0).unwrap();
        }

        let consolidator = Consolidator::new(0);
        assert!(consolidator.consolidation_possible(&dev));
        let free_before = dev.device.free_count();
        assert_eq!(run_to_completion(&consolidator, &dev), StepOutcome::Finished);

        let mut buf = [0u8; 32];
        for lnum in 0..4u32 {
            dev.read_leb(0, lnum, &mut buf, 0, false).unwrap();
            assert!(buf.iter().all(|&b| b == lnum as u8));
        }
        assert_eq!(consolidator.state(), ConsolidationState::Idle);

        // Four source PEBs are vacated, one destination PEB is consumed:
        // net gain of three free PEBs at the device level.
        assert_eq!(dev.device.free_count(), free_before + 3);
    }

    #[test]
    fn write_during_selection_cancels_consolidation() {
        let geo = geometry();
        let dev = EbaDevice::new(geo, SimDevice::new(geo, 16));
        dev.create_volume(
            VolumeConfig {
                vol_id: 0,
                reserved_pebs: 8,
                alignment: 1,
                data_pad: 0,
                compat: 0,
            },
            VolType::Dynamic,
            8,
        );
        for lnum in 0..4 {
            dev.write_leb(0, lnum, &[0xAA; 32], 0).unwrap();
        }

        let consolidator = Consolidator::new(0);
        assert_eq!(consolidator.step(&dev).unwrap(), StepOutcome::Again); // start
        assert_eq!(consolidator.step(&dev).unwrap(), StepOutcome::Again); // select+copy lnum 0

        consolidator.cancel_if_targets(0);
        let outcome = run_to_completion(&consolidator, &dev);
        assert_eq!(outcome, StepOutcome::Cancelled);
        assert_eq!(consolidator.state(), ConsolidationState::Idle);
    }

    #[test]
    fn write_to_selected_leb_cancels_registered_consolidator_automatically() {
        let geo = geometry();
        let dev = EbaDevice::new(geo, SimDevice::new(geo, 16));
        dev.create_volume(
            VolumeConfig {
                vol_id: 0,
                reserved_pebs: 8,
                alignment: 1,
                data_pad: 0,
                compat: 0,
            },
            VolType::Dynamic,
            8,
        );
        for lnum in 0..4 {
            dev.write_leb(0, lnum, &[0xAA; 32], 0).unwrap();
        }

        let consolidator = std::sync::Arc::new(Consolidator::new(0));
        dev.register_consolidator(0, consolidator.clone());

        assert_eq!(consolidator.step(&dev).unwrap(), StepOutcome::Again); // start
        assert_eq!(consolidator.step(&dev).unwrap(), StepOutcome::Again); // select+copy lnum 0

        // A direct write to the selected LEB (not a manual `cancel_if_targets`
        // call) must cancel the in-flight selection on its own.
        dev.write_leb(0, 0, &[0xBB; 32], 0).unwrap();

        let outcome = run_to_completion(&consolidator, &dev);
        assert_eq!(outcome, StepOutcome::Cancelled);
    }

    #[test]
    fn cancelled_session_requeues_its_lebs_for_a_later_consolidation() {
        let geo = geometry();
        let dev = EbaDevice::new(geo, SimDevice::new(geo, 16));
        dev.create_volume(
            VolumeConfig {
                vol_id: 0,
                reserved_pebs: 8,
                alignment: 1,
                data_pad: 0,
                compat: 0,
            },
            VolType::Dynamic,
            8,
        );
        for lnum in 0..4 {
            dev.write_leb(0, lnum, &[lnum as u8; 32], 0).unwrap();
        }

        let consolidator = Consolidator::new(0);
        assert_eq!(consolidator.step(&dev).unwrap(), StepOutcome::Again); // start
        assert_eq!(consolidator.step(&dev).unwrap(), StepOutcome::Again); // select+copy lnum 0

        consolidator.cancel_if_targets(0);
        assert_eq!(run_to_completion(&consolidator, &dev), StepOutcome::Cancelled);

        // Cancelling must hand lnum 0 back to `open`, not strand it off every
        // classification list: a fresh consolidator has to see it again.
        let again = Consolidator::new(0);
        assert!(again.consolidation_possible(&dev));
        assert_eq!(run_to_completion(&again, &dev), StepOutcome::Finished);

        let mut buf = [0u8; 32];
        for lnum in 0..4u32 {
            dev.read_leb(0, lnum, &mut buf, 0, false).unwrap();
            assert!(buf.iter().all(|&b| b == lnum as u8));
        }
    }

    #[test]
    fn consolidation_selects_four_distinct_lebs() {
        let geo = geometry();
        let dev = EbaDevice::new(geo, SimDevice::new(geo, 16));
        dev.create_volume(
            VolumeConfig {
                vol_id: 0,
                reserved_pebs: 8,
                alignment: 1,
                data_pad: 0,
                compat: 0,
            },
            VolType::Dynamic,
            8,
        );
        for lnum in 0..4 {
            dev.write_leb(0, lnum, &[0xAA; 32], 0).unwrap();
        }

        let consolidator = Consolidator::new(0);
        assert_eq!(run_to_completion(&consolidator, &dev), StepOutcome::Finished);

        // A distinct PEB per source LEB before consolidation; if the same
        // lnum were picked for every slot the other three would never have
        // been copied out of their original PEBs.
        for lnum in 0..4u32 {
            let desc = dev.get_ldesc(0, lnum).unwrap();
            assert!(desc.is_consolidated());
            assert_eq!(desc.lpos as u32, lnum);
        }
    }
}
