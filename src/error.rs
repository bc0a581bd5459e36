//! The error model returned from every public operation in this crate.

use thiserror::Error;

/// Failures and soft scheduling signals produced by the EBA core.
///
/// Most variants map directly onto a return code the original kernel driver
/// used (see the doc comment on each variant); a few (`Contention`, `Race`,
/// `BusyCancelled`) are not failures in the usual sense but signals a caller
/// is expected to match on rather than propagate with `?`.
#[derive(Debug, Error)]
pub enum EbaError {
    /// A caller passed an out-of-range `lnum`, `vol_id`, or buffer length.
    #[error("invalid argument")]
    InvalidArgument,

    /// An allocation failed (consolidation buffers, `ConsolidatedPeb`s).
    #[error("out of memory")]
    OutOfMemory,

    /// The volume has been switched read-only after an unrecoverable write.
    #[error("volume is read-only")]
    ReadOnly,

    /// No PEBs are available to satisfy the request.
    #[error("no free physical eraseblocks")]
    NoSpace,

    /// The underlying device reported a hard I/O failure.
    #[error("I/O failure on peb {pnum}")]
    IoFailure { pnum: u32 },

    /// A bitflip was detected and corrected by ECC; the read still
    /// succeeded, but the PEB should be scrubbed by the WL layer.
    #[error("bitflips detected on peb {pnum}")]
    Bitflip { pnum: u32 },

    /// A VID/EC header failed magic, version, or CRC validation.
    #[error("bad header on peb {pnum}")]
    BadHeader { pnum: u32 },

    /// A non-blocking lock acquisition found the entry already held.
    #[error("lock contended")]
    Contention,

    /// The volume or LEB this operation targeted was removed concurrently.
    #[error("lost race with concurrent removal")]
    Race,

    /// The in-flight consolidation was cancelled by a concurrent write.
    #[error("consolidation cancelled")]
    BusyCancelled,

    /// A self-check invariant did not hold; the caller should refuse to
    /// attach rather than continue with a table that may be unsound.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Non-fatal scheduling signals returned by [`crate::volume::VolumeOps::copy_peb`]
/// to the wear-leveling mover, distinct from [`EbaError`] because none of
/// them indicate the EBA core itself is broken.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MoveOutcome {
    /// The move completed; the mapping now points at the destination PEB.
    Succeeded,
    /// The volume or LEB vanished underneath the mover.
    CancelRace,
    /// The source LEB's lock was contended; try again later.
    Retry,
    /// Writing the destination PEB failed.
    TargetWrErr,
    /// Reading back the destination PEB's header failed.
    TargetRdErr,
    /// Reading back the destination PEB's header found bitflips.
    TargetBitflips,
    /// Reading the source PEB failed.
    SourceRdErr,
}

pub type Result<T> = std::result::Result<T, EbaError>;
