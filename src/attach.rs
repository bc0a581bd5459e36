//! Bootstrapping an [`EbaDevice`] from an external scan/fastmap module, and
//! cross-checking the two reconstructions against each other (§4.7).
//!
//! Everything in this module is driven by data an external attach process
//! (out of scope here, per §1) has already produced; this crate only
//! consumes it.

use std::collections::HashMap;

use log::{error, warn};

use crate::config::VolumeConfig;
use crate::device::{Media, PebIo, Wl};
use crate::error::{EbaError, Result};
use crate::header::VolType;
use crate::leb::UNMAPPED;
use crate::volume::EbaDevice;

/// One `(lnum, pnum)` mapping an external scan or fastmap reconstructed for
/// a volume.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LebMapping {
    pub lnum: u32,
    pub pnum: u32,
}

/// Everything [`EbaDevice::attach`] needs to know about one volume to
/// rebuild its [`EbaTable`][crate::eba::EbaTable].
#[derive(Debug, Clone)]
pub struct VolumeAttachInfo {
    pub config: VolumeConfig,
    pub vol_type: VolType,
    /// Number of LEBs this volume is sized for. Mappings for `lnum >=
    /// nlebs` are stale (e.g. left over from an unclean reboot during a
    /// volume resize) and are reported back via [`AttachOutcome::erase`]
    /// rather than installed.
    pub nlebs: u32,
    pub mappings: Vec<LebMapping>,
}

/// The attach-time snapshot this crate's bootstrap consumes, produced by an
/// external scan or fastmap module.
#[derive(Debug, Clone, Default)]
pub struct AttachInfo {
    pub volumes: Vec<VolumeAttachInfo>,
    /// The highest sqnum observed across every VID header found on media;
    /// [`EbaDevice::attach`] resumes the sequence counter strictly above
    /// this.
    pub max_sqnum: u64,
    /// Total PEBs on the device available for the EBA layer to draw on,
    /// prior to reserving `EBA_RESERVED_PEBS` or bad-block headroom.
    pub avail_pebs: u32,
    /// Whether bad-block handling is enabled; if so, up to
    /// `beb_rsvd_level` additional PEBs are reserved on top of
    /// `EBA_RESERVED_PEBS`.
    pub beb_rsvd_level: u32,
    pub bad_block_handling: bool,
}

/// What attach decided needs to happen outside of this crate's bookkeeping.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AttachOutcome {
    /// PEBs an external mapping claimed for out-of-range LEBs; the WL
    /// collaborator should erase and reuse these rather than this crate
    /// ever trying to read them back as valid data.
    pub erase_pebs: Vec<u32>,
    /// PEBs reserved so `atomic_leb_change` always has one to draw from,
    /// even when the device is otherwise completely full.
    pub reserved_for_atomic_change: u32,
    /// PEBs additionally reserved for bad-block handling, `0` if disabled.
    pub reserved_for_bad_blocks: u32,
}

impl<D: PebIo + Wl + Media> EbaDevice<D> {
    /// Bootstrap every volume's [`EbaTable`][crate::eba::EbaTable] from
    /// `info`, mirroring `ubi_eba_init`: each volume gets an `eba_lock` (by
    /// construction, since [`crate::eba::EbaTable`] is always guarded by
    /// one), a fresh table, and its known mappings installed. Returns what
    /// the caller still owes the WL/erase layer.
    pub fn attach(&self, info: &AttachInfo) -> Result<AttachOutcome> {
        self.resume_sqnum(info.max_sqnum);

        let mut erase_pebs = Vec::new();

        for vol in &info.volumes {
            self.create_volume(vol.config, vol.vol_type, vol.nlebs);

            for mapping in &vol.mappings {
                if mapping.lnum >= vol.nlebs {
                    warn!(
                        "vol {}: dropping out-of-range mapping lnum {} -> peb {} (likely an unclean reboot mid-resize)",
                        vol.config.vol_id, mapping.lnum, mapping.pnum
                    );
                    erase_pebs.push(mapping.pnum);
                    continue;
                }
                self.set_known_mapping(vol.config.vol_id, mapping.lnum, mapping.pnum)?;
            }
        }

        if info.avail_pebs < self.geometry().eba_reserved_pebs {
            error!(
                "not enough physical eraseblocks ({}, need {})",
                info.avail_pebs,
                self.geometry().eba_reserved_pebs
            );
            return Err(EbaError::NoSpace);
        }
        let mut remaining = info.avail_pebs - self.geometry().eba_reserved_pebs;

        let reserved_for_bad_blocks = if info.bad_block_handling {
            let level = info.beb_rsvd_level.min(remaining);
            remaining -= level;
            level
        } else {
            0
        };

        Ok(AttachOutcome {
            erase_pebs,
            reserved_for_atomic_change: self.geometry().eba_reserved_pebs,
            reserved_for_bad_blocks,
        })
    }
}

/// Compare the EBA mappings an external fastmap reconstruction and a full
/// scan each produced for the same device, tolerating the case where one
/// side thinks a LEB is unmapped and the other has a stale (not-yet-GCed)
/// mapping for it — this is the expected "fastmap lag" the source's comment
/// describes. Any other disagreement means one of the two reconstructions
/// is unsound and is reported as a fatal [`EbaError::Invariant`].
pub fn self_check_eba(ai_fastmap: &AttachInfo, ai_scan: &AttachInfo) -> Result<()> {
    let scan_volumes: HashMap<u32, &VolumeAttachInfo> = ai_scan
        .volumes
        .iter()
        .map(|v| (v.config.vol_id, v))
        .collect();

    for fm_vol in &ai_fastmap.volumes {
        let scan_vol = match scan_volumes.get(&fm_vol.config.vol_id) {
            Some(v) => *v,
            None => continue,
        };

        let nlebs = fm_vol.nlebs.max(scan_vol.nlebs);
        let mut fm_eba = vec![UNMAPPED; nlebs as usize];
        let mut scan_eba = vec![UNMAPPED; nlebs as usize];

        for mapping in &fm_vol.mappings {
            if (mapping.lnum as usize) < fm_eba.len() {
                fm_eba[mapping.lnum as usize] = mapping.pnum;
            }
        }
        for mapping in &scan_vol.mappings {
            if (mapping.lnum as usize) < scan_eba.len() {
                scan_eba[mapping.lnum as usize] = mapping.pnum;
            }
        }

        for lnum in 0..nlebs as usize {
            let (fm_pnum, scan_pnum) = (fm_eba[lnum], scan_eba[lnum]);
            if fm_pnum == scan_pnum {
                continue;
            }
            if fm_pnum == UNMAPPED || scan_pnum == UNMAPPED {
                continue;
            }
            return Err(EbaError::Invariant(format!(
                "vol {} leb {lnum}: fastmap says peb {fm_pnum}, scan says peb {scan_pnum}",
                fm_vol.config.vol_id
            )));
        }
    }

    Ok(())
}
