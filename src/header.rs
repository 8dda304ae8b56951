#![allow(dead_code)]

use nom::number::complete::u32 as nom_u32;
use num_derive::FromPrimitive;

use crate::machine::{CpuSubType, CpuType};
use crate::reader::Endian;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum MHFileType {
    MhObject = 0x1,
    MhExecute = 0x2,
    MhFvmlib = 0x3,
    MhCore = 0x4,
    MhPreload = 0x5,
    MhDylib = 0x6,
    MhDylinker = 0x7,
    MhBundle = 0x8,
    MhDylibStub = 0x9,
    MhDsym = 0xa,
    MhKextBundle = 0xb,
    MhFileset = 0xc,
    MhGpuExecute = 0xd,
    MhGpuDylib = 0xe,
}

impl MHFileType {
    pub fn parse(bytes: &[u8], endian: Endian) -> nom::IResult<&[u8], MHFileType> {
        let (bytes, raw) = nom_u32(endian.nom())(bytes)?;
        match num::FromPrimitive::from_u32(raw) {
            Some(filetype) => Ok((bytes, filetype)),
            None => Err(nom::Err::Failure(nom::error::Error::new(
                bytes,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MHFlags: u32 {
        const MH_NOUNDEFS = 0x1;
        const MH_INCRLINK = 0x2;
        const MH_DYLDLINK = 0x4;
        const MH_BINDATLOAD = 0x8;
        const MH_PREBOUND = 0x10;
        const MH_SPLIT_SEGS = 0x20;
        const MH_LAZY_INIT = 0x40;
        const MH_TWOLEVEL = 0x80;
        const MH_FORCE_FLAT = 0x100;
        const MH_NOMULTIDEFS = 0x200;
        const MH_NOFIXPREBINDING = 0x400;
        const MH_PREBINDABLE = 0x800;
        const MH_ALLMODSBOUND = 0x1000;
        const MH_SUBSECTIONS_VIA_SYMBOLS = 0x2000;
        const MH_CANONICAL = 0x4000;
        const MH_WEAK_DEFINES = 0x8000;
        const MH_BINDS_TO_WEAK = 0x10000;
        const MH_ALLOW_STACK_EXECUTION = 0x20000;
        const MH_ROOT_SAFE = 0x40000;
        const MH_SETUID_SAFE = 0x80000;
        const MH_NO_REEXPORTED_DYLIBS = 0x100000;
        const MH_PIE = 0x200000;
        const MH_DEAD_STRIPPABLE_DYLIB = 0x400000;
        const MH_HAS_TLV_DESCRIPTORS = 0x800000;
        const MH_NO_HEAP_EXECUTION = 0x1000000;
        const MH_APP_EXTENSION_SAFE = 0x2000000;
        const MH_NLIST_OUTOFSYNC_WITH_DYLDINFO = 0x4000000;
        const MH_SIM_SUPPORT = 0x8000000;
        const MH_DYLIB_IN_CACHE = 0x80000000;
    }
}

impl MHFlags {
    pub fn parse(bytes: &[u8], endian: Endian) -> nom::IResult<&[u8], MHFlags> {
        let (bytes, raw) = nom_u32(endian.nom())(bytes)?;
        Ok((bytes, MHFlags::from_bits_truncate(raw)))
    }
}

/// The mach header, normalized over the 32/64-bit layouts.
///
/// The 64-bit form only adds a trailing `reserved` word, so one struct with
/// an `is64` discriminant carries both.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,
    pub cputype: CpuType,
    pub cpusubtype: CpuSubType,
    pub filetype: MHFileType,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: MHFlags,
    pub is64: bool,
    pub byte_order: Endian,
}

impl MachHeader {
    /// Size of the header on disk; load commands start right after.
    pub fn size(&self) -> u64 {
        if self.is64 {
            32
        } else {
            28
        }
    }

    pub fn parse(bytes: &[u8], is64: bool, endian: Endian) -> nom::IResult<&[u8], MachHeader> {
        let e = endian.nom();
        let (bytes, magic) = nom::number::complete::be_u32(bytes)?;
        let (bytes, cputype_raw) = nom_u32(e)(bytes)?;
        let cputype = CpuType::from_raw(cputype_raw).map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(bytes, nom::error::ErrorKind::Tag))
        })?;
        let (bytes, cpusubtype_raw) = nom_u32(e)(bytes)?;
        let (bytes, filetype) = MHFileType::parse(bytes, endian)?;
        let (bytes, ncmds) = nom_u32(e)(bytes)?;
        let (bytes, sizeofcmds) = nom_u32(e)(bytes)?;
        let (bytes, flags) = MHFlags::parse(bytes, endian)?;
        let bytes = if is64 {
            let (bytes, _reserved) = nom_u32(e)(bytes)?;
            bytes
        } else {
            bytes
        };

        Ok((
            bytes,
            MachHeader {
                magic,
                cputype,
                cpusubtype: CpuSubType::new(cpusubtype_raw),
                filetype,
                ncmds,
                sizeofcmds,
                flags,
                is64,
                byte_order: endian,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn sample_header_bytes(ncmds: u32, sizeofcmds: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&crate::fat::MH_MAGIC_64.to_le_bytes());
        buf.extend_from_slice(&(CpuType::Arm64 as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(MHFileType::MhDylib as u32).to_le_bytes());
        buf.extend_from_slice(&ncmds.to_le_bytes());
        buf.extend_from_slice(&sizeofcmds.to_le_bytes());
        buf.extend_from_slice(&(MHFlags::MH_DYLDLINK | MHFlags::MH_PIE).bits().to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    #[test]
    fn parses_little_endian_64() {
        let buf = sample_header_bytes(3, 0x200);
        let (rest, header) = MachHeader::parse(&buf, true, Endian::Little).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.cputype, CpuType::Arm64);
        assert_eq!(header.filetype, MHFileType::MhDylib);
        assert_eq!(header.ncmds, 3);
        assert_eq!(header.sizeofcmds, 0x200);
        assert!(header.flags.contains(MHFlags::MH_PIE));
        assert_eq!(header.size(), 32);
    }

    #[test]
    fn rejects_unknown_filetype() {
        let mut buf = sample_header_bytes(0, 0);
        buf[12..16].copy_from_slice(&0xffu32.to_le_bytes());
        assert!(MachHeader::parse(&buf, true, Endian::Little).is_err());
    }
}
