//! Device- and volume-scoped constants threaded through every operation,
//! rather than recomputed or read from global state at call time.

/// Constants computed once at attach time from the underlying medium.
#[derive(Debug, Clone, Copy)]
pub struct DeviceGeometry {
    /// Usable bytes per logical eraseblock.
    pub leb_size: u32,
    /// Smallest unit the medium can be written in.
    pub min_io_size: u32,
    /// Byte offset of the VID header region within a PEB.
    pub vid_hdr_offset: u32,
    /// Byte offset where LEB data begins, i.e. past the EC and VID header
    /// region. Every data read/write computed by `LebIo` is relative to
    /// this, matching §4.4's `offset = leb_start + ...` (not just
    /// `vid_hdr_offset`, since the VID header region itself occupies space
    /// before the data area starts).
    pub leb_start: u32,
    /// Number of LEBs a consolidated PEB can hold (`K`). `1` on SLC media,
    /// where consolidation is a no-op.
    pub pairing_groups: u32,
    /// Number of PEBs reserved so `atomic_leb_change` always has one to
    /// draw from, even when the device is otherwise full.
    pub eba_reserved_pebs: u32,
    /// Upper bound on write retries before a volume is switched read-only.
    pub io_retries: u32,
}

impl DeviceGeometry {
    /// Is this medium capable of consolidation?
    pub fn is_mlc(&self) -> bool {
        self.pairing_groups > 1
    }
}

/// Per-volume constants, analogous to the fields UBI reads out of a volume
/// table record.
#[derive(Debug, Clone, Copy)]
pub struct VolumeConfig {
    pub vol_id: u32,
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub compat: u8,
}
