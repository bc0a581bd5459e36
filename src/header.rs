//! On-media EC/VID header encoding, with CRC verification.
//!
//! Mirrors the `income`-wrapping idiom the teacher used (`ParseHeader`,
//! `ComputeCrc`, ergonomic wrapper structs over the raw `deku`-derived
//! layout) but defines its own raw structs directly, since this crate's VID
//! header needs a `flags` field the teacher's borrowed crate didn't have.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;
pub use deku::{DekuContainerRead, DekuContainerWrite};

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

const UBI_EC_HDR_MAGIC: [u8; 4] = *b"UBI#";
const UBI_VID_HDR_MAGIC: [u8; 4] = *b"UBI!";

/// Set on a VID header written for a slot of a consolidated PEB.
pub const VID_FLAG_CONSOLIDATED: u32 = 1 << 0;

/// A trait missing from raw `deku` structs: parses a header from a byte
/// slice, validating magic, version, and CRC all at once.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if (header.get_hdr_magic(), header.get_hdr_version()) != (Self::get_magic(), UBI_VERSION) {
            return None;
        }

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }
}

/// Computes and checks the trailing CRC32 of a header.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap();
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

#[derive(Debug, Default, Eq, PartialEq, Clone, Copy, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct EcHdrRaw {
    magic: [u8; 4],
    version: u8,
    padding1: [u8; 3],
    ec: u64,
    vid_hdr_offset: u32,
    data_offset: u32,
    image_seq: u32,
    padding2: [u8; 24],
    hdr_crc: u32,
}

impl ParseHeader<'_> for EcHdrRaw {
    fn get_magic() -> &'static [u8] {
        &UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ComputeCrc for EcHdrRaw {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// The erase-counter header, ergonomic form.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    pub fn inc_ec(mut self) -> Self {
        self.ec += 1;
        self
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        EcHdrRaw::parse(bytes).map(Self::from)
    }

    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = EcHdrRaw::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<EcHdrRaw> for Ec {
    fn from(value: EcHdrRaw) -> Self {
        Self {
            ec: value.ec,
            vid_hdr_offset: value.vid_hdr_offset,
            data_offset: value.data_offset,
            image_seq: value.image_seq,
        }
    }
}

impl From<Ec> for EcHdrRaw {
    fn from(value: Ec) -> EcHdrRaw {
        let mut target = Self {
            magic: UBI_EC_HDR_MAGIC,
            version: UBI_VERSION,
            padding1: Default::default(),
            ec: value.ec,
            vid_hdr_offset: value.vid_hdr_offset,
            data_offset: value.data_offset,
            image_seq: value.image_seq,
            padding2: Default::default(),
            hdr_crc: Default::default(),
        };
        target.fix_crc();
        target
    }
}

/// UBI volume types.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    #[default]
    Dynamic,
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Default, Eq, PartialEq, Clone, Copy, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct VidHdrRaw {
    magic: [u8; 4],
    version: u8,
    vol_type: u8,
    copy_flag: u8,
    compat: u8,
    vol_id: u32,
    lnum: u32,
    data_size: u32,
    used_ebs: u32,
    data_pad: u32,
    data_crc: u32,
    sqnum: u64,
    flags: u32,
    padding: [u8; 12],
    hdr_crc: u32,
}

impl ParseHeader<'_> for VidHdrRaw {
    fn get_magic() -> &'static [u8] {
        &UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ComputeCrc for VidHdrRaw {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// The volume-ID header, ergonomic form. One per whole-PEB LEB, or one per
/// slot of a consolidated PEB (see [`VID_FLAG_CONSOLIDATED`]).
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub vol_type: VolType,
    pub copy_flag: bool,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub sqnum: u64,
    pub consolidated: bool,
}

impl Vid {
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        VidHdrRaw::parse(bytes).and_then(|raw| raw.try_into().ok())
    }

    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = VidHdrRaw::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdrRaw> for Vid {
    type Error = ();

    fn try_from(value: VidHdrRaw) -> Result<Self, Self::Error> {
        Ok(Self {
            vol_type: value.vol_type.try_into()?,
            copy_flag: value.copy_flag != 0,
            compat: value.compat,
            vol_id: value.vol_id,
            lnum: value.lnum,
            data_size: value.data_size,
            used_ebs: value.used_ebs,
            data_pad: value.data_pad,
            data_crc: value.data_crc,
            sqnum: value.sqnum,
            consolidated: value.flags & VID_FLAG_CONSOLIDATED != 0,
        })
    }
}

impl From<Vid> for VidHdrRaw {
    fn from(value: Vid) -> VidHdrRaw {
        let flags = if value.consolidated {
            VID_FLAG_CONSOLIDATED
        } else {
            0
        };

        let mut target = Self {
            magic: UBI_VID_HDR_MAGIC,
            version: UBI_VERSION,
            vol_type: value.vol_type.into(),
            copy_flag: value.copy_flag.into(),
            compat: value.compat,
            vol_id: value.vol_id,
            lnum: value.lnum,
            data_size: value.data_size,
            used_ebs: value.used_ebs,
            data_pad: value.data_pad,
            data_crc: value.data_crc,
            sqnum: value.sqnum,
            flags,
            padding: Default::default(),
            hdr_crc: Default::default(),
        };
        target.fix_crc();
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ec_roundtrips() -> anyhow::Result<()> {
        let ec = Ec::default().ec(7).inc_ec();
        let mut buf = vec![0u8; 256];
        ec.encode(&mut buf)?;
        assert_eq!(Ec::decode(&buf), Some(ec));
        Ok(())
    }

    #[test]
    fn vid_roundtrips_with_consolidated_flag() -> anyhow::Result<()> {
        let vid = Vid {
            vol_id: 3,
            lnum: 9,
            sqnum: 100,
            consolidated: true,
            ..Default::default()
        };
        let mut buf = vec![0u8; 256];
        vid.encode(&mut buf)?;
        assert_eq!(Vid::decode(&buf), Some(vid));
        Ok(())
    }

    #[test]
    fn corrupted_header_fails_crc() -> anyhow::Result<()> {
        let vid = Vid::default().sqnum(1);
        let mut buf = vec![0u8; 256];
        vid.encode(&mut buf)?;
        buf[5] ^= 0xFF;
        assert_eq!(Vid::decode(&buf), None);
        Ok(())
    }
}
