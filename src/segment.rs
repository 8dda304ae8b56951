#![allow(dead_code)]

use nom::number::complete::{u32 as nom_u32, u64 as nom_u64};
use num_derive::FromPrimitive;

use crate::helpers::string_upto_null_terminator;
use crate::reader::Endian;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const NONE = 0x00;
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
    }
}

impl Protection {
    pub fn parse(bytes: &[u8], endian: Endian) -> nom::IResult<&[u8], Protection> {
        let (bytes, prot) = nom_u32(endian.nom())(bytes)?;
        Ok((bytes, Protection::from_bits_truncate(prot)))
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SGFlags: u32 {
        const SG_HIGHVM = 0x1;
        const SG_FVMLIB = 0x2;
        const SG_NORELOC = 0x4;
        const SG_PROTECTED_VERSION_1 = 0x8;
        const SG_READ_ONLY = 0x10;
    }
}

impl SGFlags {
    pub fn parse(bytes: &[u8], endian: Endian) -> nom::IResult<&[u8], SGFlags> {
        let (bytes, flags) = nom_u32(endian.nom())(bytes)?;
        Ok((bytes, SGFlags::from_bits_truncate(flags)))
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SectionType {
    SRegular = 0x0,
    SZeroFill = 0x1,
    SCstringLiterals = 0x2,
    S4ByteLiterals = 0x3,
    S8ByteLiterals = 0x4,
    SLiteralPointers = 0x5,
    SNonLazySymbolPointers = 0x6,
    SLazySymbolPointers = 0x7,
    SSymbolStubs = 0x8,
    SModInitFuncPointers = 0x9,
    SModTermFuncPointers = 0xa,
    SCoalesced = 0xb,
    SGbZeroFill = 0xc,
    SInterposing = 0xd,
    S16ByteLiterals = 0xe,
    SDtraceDof = 0xf,
    SLazyDylibSymbolPointers = 0x10,
    SThreadLocalRegular = 0x11,
    SThreadLocalZeroFill = 0x12,
    SThreadLocalVariables = 0x13,
    SThreadLocalVariablePointers = 0x14,
    SThreadLocalInitFunctionPointers = 0x15,
    SInitFuncOffsets = 0x16,
}

impl SectionType {
    pub const SECTION_TYPE_MASK: u32 = 0x000000ff;

    pub fn from_flags(flags: u32) -> SectionType {
        num::FromPrimitive::from_u32(flags & Self::SECTION_TYPE_MASK)
            .unwrap_or(SectionType::SRegular)
    }
}

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionAttributes: u32 {
        const S_ATTR_PURE_INSTRUCTIONS = 0x80000000;
        const S_ATTR_NO_TOC = 0x40000000;
        const S_ATTR_STRIP_STATIC_SYMS = 0x20000000;
        const S_ATTR_NO_DEAD_STRIP = 0x10000000;
        const S_ATTR_LIVE_SUPPORT = 0x08000000;
        const S_ATTR_SELF_MODIFYING_CODE = 0x04000000;
        const S_ATTR_DEBUG = 0x02000000;
        const S_ATTR_SOME_INSTRUCTIONS = 0x00000400;
        const S_ATTR_EXT_RELOC = 0x00000200;
        const S_ATTR_LOC_RELOC = 0x00000100;
    }
}

impl SectionAttributes {
    pub const SECTION_ATTRIBUTES_MASK: u32 = 0xffffff00;

    pub fn from_flags(flags: u32) -> SectionAttributes {
        SectionAttributes::from_bits_truncate(flags & Self::SECTION_ATTRIBUTES_MASK)
    }
}

/// A section header, normalized over the 32/64-bit layouts.
#[derive(Debug, Clone)]
pub struct Section {
    pub sectname: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub sectype: SectionType,
    pub attrs: SectionAttributes,
    pub reserved: [u32; 3],
}

impl Section {
    pub fn parse(bytes: &[u8], is64: bool, endian: Endian) -> nom::IResult<&[u8], Section> {
        let e = endian.nom();
        let (bytes, sectname_bytes) = nom::bytes::complete::take(16usize)(bytes)?;
        let (_, sectname) = string_upto_null_terminator(sectname_bytes)?;
        let (bytes, segname_bytes) = nom::bytes::complete::take(16usize)(bytes)?;
        let (_, segname) = string_upto_null_terminator(segname_bytes)?;

        let (bytes, addr) = if is64 {
            nom_u64(e)(bytes)?
        } else {
            let (bytes, v) = nom_u32(e)(bytes)?;
            (bytes, v as u64)
        };
        let (bytes, size) = if is64 {
            nom_u64(e)(bytes)?
        } else {
            let (bytes, v) = nom_u32(e)(bytes)?;
            (bytes, v as u64)
        };
        let (bytes, (offset, align, reloff, nreloc, flags)) = nom::sequence::tuple((
            nom_u32(e),
            nom_u32(e),
            nom_u32(e),
            nom_u32(e),
            nom_u32(e),
        ))(bytes)?;
        let (bytes, reserved1) = nom_u32(e)(bytes)?;
        let (bytes, reserved2) = nom_u32(e)(bytes)?;
        let (bytes, reserved3) = if is64 {
            nom_u32(e)(bytes)?
        } else {
            (bytes, 0)
        };

        Ok((
            bytes,
            Section {
                sectname,
                segname,
                addr,
                size,
                offset,
                align,
                reloff,
                nreloc,
                sectype: SectionType::from_flags(flags),
                attrs: SectionAttributes::from_flags(flags),
                reserved: [reserved1, reserved2, reserved3],
            },
        ))
    }
}

/// An `LC_SEGMENT`/`LC_SEGMENT_64` with its owned sections.
#[derive(Debug, Clone)]
pub struct Segment {
    pub segname: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: Protection,
    pub initprot: Protection,
    pub flags: SGFlags,
    pub sections: Vec<Section>,
}

impl Segment {
    /// Size of the fixed part of the command, before the section headers.
    pub fn fixed_size(is64: bool) -> usize {
        if is64 {
            72
        } else {
            56
        }
    }

    pub fn section_size(is64: bool) -> usize {
        if is64 {
            80
        } else {
            68
        }
    }

    /// Parse the command body after the 8-byte load-command base.
    pub fn parse(bytes: &[u8], is64: bool, endian: Endian) -> nom::IResult<&[u8], Segment> {
        let e = endian.nom();
        let (bytes, segname_bytes) = nom::bytes::complete::take(16usize)(bytes)?;
        let (_, segname) = string_upto_null_terminator(segname_bytes)?;

        let (bytes, vmaddr) = if is64 {
            nom_u64(e)(bytes)?
        } else {
            let (bytes, v) = nom_u32(e)(bytes)?;
            (bytes, v as u64)
        };
        let (bytes, vmsize) = if is64 {
            nom_u64(e)(bytes)?
        } else {
            let (bytes, v) = nom_u32(e)(bytes)?;
            (bytes, v as u64)
        };
        let (bytes, fileoff) = if is64 {
            nom_u64(e)(bytes)?
        } else {
            let (bytes, v) = nom_u32(e)(bytes)?;
            (bytes, v as u64)
        };
        let (bytes, filesize) = if is64 {
            nom_u64(e)(bytes)?
        } else {
            let (bytes, v) = nom_u32(e)(bytes)?;
            (bytes, v as u64)
        };
        let (bytes, maxprot) = Protection::parse(bytes, endian)?;
        let (bytes, initprot) = Protection::parse(bytes, endian)?;
        let (bytes, nsects) = nom_u32(e)(bytes)?;
        let (bytes, flags) = SGFlags::parse(bytes, endian)?;

        let mut cursor = bytes;
        let mut sections = Vec::with_capacity(nsects as usize);
        for _ in 0..nsects {
            let (next, section) = Section::parse(cursor, is64, endian)?;
            sections.push(section);
            cursor = next;
        }

        Ok((
            cursor,
            Segment {
                segname,
                vmaddr,
                vmsize,
                fileoff,
                filesize,
                maxprot,
                initprot,
                flags,
                sections,
            },
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn segment64_roundtrip() {
        let mut seg = plain_segment("__DATA", 0x8000, 0x4000, 0x8000);
        seg.sections
            .push(plain_section("__DATA", "__objc_classlist", 0x8010, 0x20, 0x8010));
        let encoded = encode_segment64(&seg);
        let (rest, parsed) = Segment::parse(&encoded, true, Endian::Little).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.segname, "__DATA");
        assert_eq!(parsed.vmaddr, 0x8000);
        assert_eq!(parsed.sections.len(), 1);
        assert_eq!(parsed.sections[0].sectname, "__objc_classlist");
        assert_eq!(parsed.sections[0].addr, 0x8010);
    }

    #[test]
    fn section_flags_split() {
        let flags = 0x80000002u32;
        assert_eq!(SectionType::from_flags(flags), SectionType::SCstringLiterals);
        assert!(SectionAttributes::from_flags(flags)
            .contains(SectionAttributes::S_ATTR_PURE_INSTRUCTIONS));
    }
}
