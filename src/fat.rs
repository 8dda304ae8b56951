#![allow(dead_code)]

use nom::number::complete::u32 as nom_u32;

use crate::error::{DumpError, DumpResult};
use crate::machine::{CpuSubType, CpuType};
use crate::reader::Endian;
use crate::source::ByteSource;

pub const MH_MAGIC: u32 = 0xFEEDFACE;
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;
pub const MH_CIGAM: u32 = 0xCEFAEDFE;
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;
pub const FAT_MAGIC: u32 = 0xCAFEBABE;
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;
pub const FAT_CIGAM: u32 = 0xBEBAFECA;
pub const FAT_CIGAM_64: u32 = 0xBFBAFECA;

/// What the first word of the file says it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Thin { is64: bool, byte_order: Endian },
    Fat { is64: bool, swapped: bool },
}

impl Magic {
    /// The stored word is read big-endian; thin little-endian slices show up
    /// as the byte-swapped CIGAM constants.
    pub fn detect(word: u32) -> DumpResult<Magic> {
        match word {
            MH_MAGIC => Ok(Magic::Thin {
                is64: false,
                byte_order: Endian::Big,
            }),
            MH_MAGIC_64 => Ok(Magic::Thin {
                is64: true,
                byte_order: Endian::Big,
            }),
            MH_CIGAM => Ok(Magic::Thin {
                is64: false,
                byte_order: Endian::Little,
            }),
            MH_CIGAM_64 => Ok(Magic::Thin {
                is64: true,
                byte_order: Endian::Little,
            }),
            FAT_MAGIC => Ok(Magic::Fat {
                is64: false,
                swapped: false,
            }),
            FAT_MAGIC_64 => Ok(Magic::Fat {
                is64: true,
                swapped: false,
            }),
            FAT_CIGAM => Ok(Magic::Fat {
                is64: false,
                swapped: true,
            }),
            FAT_CIGAM_64 => Ok(Magic::Fat {
                is64: true,
                swapped: true,
            }),
            other => Err(DumpError::InvalidInput(format!(
                "unrecognized magic {other:#010x}"
            ))),
        }
    }
}

/// One architecture-specific region of the input.
///
/// This is the unit everything downstream consumes: a thin file produces a
/// single slice covering the whole source, a fat archive produces one per
/// `fat_arch` entry.
#[derive(Debug, Clone, Copy)]
pub struct ArchSlice {
    pub cpu_type: CpuType,
    pub cpu_subtype: CpuSubType,
    pub byte_order: Endian,
    pub pointer_size: u8,
    pub offset: u64,
    pub size: u64,
    pub align: u32,
}

impl ArchSlice {
    pub fn is64(&self) -> bool {
        self.pointer_size == 8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FatHeader {
    pub magic: Magic,
    pub nfat_arch: u32,
}

impl FatHeader {
    pub fn parse(bytes: &[u8]) -> nom::IResult<&[u8], FatHeader> {
        let (bytes, word) = nom::number::complete::be_u32(bytes)?;
        let magic = Magic::detect(word).map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(bytes, nom::error::ErrorKind::Tag))
        })?;
        let endian = match magic {
            Magic::Fat { swapped: true, .. } => Endian::Little,
            _ => Endian::Big,
        };
        let (bytes, nfat_arch) = nom_u32(endian.nom())(bytes)?;
        Ok((bytes, FatHeader { magic, nfat_arch }))
    }
}

/// A raw `fat_arch` / `fat_arch_64` table entry.
#[derive(Debug, Clone, Copy)]
pub struct FatArch {
    pub cputype: CpuType,
    pub cpusubtype: CpuSubType,
    pub offset: u64,
    pub size: u64,
    pub align: u32,
}

impl FatArch {
    pub fn parse(bytes: &[u8], is64: bool, endian: Endian) -> nom::IResult<&[u8], FatArch> {
        let e = endian.nom();
        let (bytes, cputype_raw) = nom_u32(e)(bytes)?;
        let (bytes, cpusubtype_raw) = nom_u32(e)(bytes)?;
        let cputype = CpuType::from_raw(cputype_raw).map_err(|_| {
            nom::Err::Failure(nom::error::Error::new(bytes, nom::error::ErrorKind::Tag))
        })?;
        let cpusubtype = CpuSubType::new(cpusubtype_raw);
        if is64 {
            let (bytes, offset) = nom::number::complete::u64(e)(bytes)?;
            let (bytes, size) = nom::number::complete::u64(e)(bytes)?;
            let (bytes, align) = nom_u32(e)(bytes)?;
            let (bytes, _reserved) = nom_u32(e)(bytes)?;
            Ok((
                bytes,
                FatArch {
                    cputype,
                    cpusubtype,
                    offset,
                    size,
                    align,
                },
            ))
        } else {
            let (bytes, offset) = nom_u32(e)(bytes)?;
            let (bytes, size) = nom_u32(e)(bytes)?;
            let (bytes, align) = nom_u32(e)(bytes)?;
            Ok((
                bytes,
                FatArch {
                    cputype,
                    cpusubtype,
                    offset: offset as u64,
                    size: size as u64,
                    align,
                },
            ))
        }
    }
}

/// Host-default preference order used when the caller passes none.
pub const DEFAULT_PREFERENCE: &[(CpuType, u32)] = &[(CpuType::Arm64, 0), (CpuType::X86_64, 0)];

/// Enumerate the slices of a thin or fat input.
pub fn enumerate_slices(source: &dyn ByteSource) -> DumpResult<Vec<ArchSlice>> {
    let head = source.read(0, 4)?;
    let word = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    match Magic::detect(word)? {
        Magic::Thin { is64, byte_order } => {
            let slice = thin_slice(source, is64, byte_order)?;
            Ok(vec![slice])
        }
        Magic::Fat { is64, swapped } => {
            let endian = if swapped { Endian::Little } else { Endian::Big };
            let header_bytes = source.read(0, 8)?;
            let (_, header) = FatHeader::parse(header_bytes)
                .map_err(|_| DumpError::InvalidInput("corrupt fat header".into()))?;
            if header.nfat_arch == 0 || header.nfat_arch > 128 {
                return Err(DumpError::InvalidInput(format!(
                    "implausible fat arch count {}",
                    header.nfat_arch
                )));
            }
            let entry_size = if is64 { 32 } else { 20 };
            let table = source.read(8, entry_size * header.nfat_arch as usize)?;
            let mut cursor = table;
            let mut slices = Vec::with_capacity(header.nfat_arch as usize);
            for _ in 0..header.nfat_arch {
                let (next, arch) = FatArch::parse(cursor, is64, endian)
                    .map_err(|_| DumpError::InvalidInput("corrupt fat arch entry".into()))?;
                cursor = next;
                if arch.offset + arch.size > source.len() as u64 {
                    return Err(DumpError::range(arch.offset, arch.size, source.len() as u64));
                }
                slices.push(slice_from_arch(source, &arch)?);
            }
            Ok(slices)
        }
    }
}

/// Pick the slice to process: first preference that matches, else the host
/// default order, else the first slice.
pub fn select_slice(
    source: &dyn ByteSource,
    preference: &[(CpuType, u32)],
) -> DumpResult<ArchSlice> {
    let slices = enumerate_slices(source)?;
    let prefs = if preference.is_empty() {
        DEFAULT_PREFERENCE
    } else {
        preference
    };
    for (cpu, sub) in prefs {
        if let Some(found) = slices
            .iter()
            .find(|s| s.cpu_type == *cpu && s.cpu_subtype.matches(*sub))
        {
            return Ok(*found);
        }
    }
    slices
        .first()
        .copied()
        .ok_or_else(|| DumpError::InvalidInput("no architecture slices".into()))
}

fn thin_slice(source: &dyn ByteSource, is64: bool, byte_order: Endian) -> DumpResult<ArchSlice> {
    // cputype/cpusubtype sit right after the magic in the mach header.
    let bytes = source.read(4, 8)?;
    let read = |raw: [u8; 4]| match byte_order {
        Endian::Little => u32::from_le_bytes(raw),
        Endian::Big => u32::from_be_bytes(raw),
    };
    let cputype = CpuType::from_raw(read([bytes[0], bytes[1], bytes[2], bytes[3]]))?;
    let cpusubtype = CpuSubType::new(read([bytes[4], bytes[5], bytes[6], bytes[7]]));
    Ok(ArchSlice {
        cpu_type: cputype,
        cpu_subtype: cpusubtype,
        byte_order,
        pointer_size: if is64 { 8 } else { 4 },
        offset: 0,
        size: source.len() as u64,
        align: 0,
    })
}

fn slice_from_arch(source: &dyn ByteSource, arch: &FatArch) -> DumpResult<ArchSlice> {
    // The embedded slice carries its own magic; trust it for endianness so a
    // hand-built fat file with mixed byte orders still parses.
    let head = source.read(arch.offset, 4)?;
    let word = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let (is64, byte_order) = match Magic::detect(word)? {
        Magic::Thin { is64, byte_order } => (is64, byte_order),
        Magic::Fat { .. } => {
            return Err(DumpError::InvalidInput(
                "fat archive nested inside fat archive".into(),
            ))
        }
    };
    Ok(ArchSlice {
        cpu_type: arch.cputype,
        cpu_subtype: arch.cpusubtype,
        byte_order,
        pointer_size: if is64 { 8 } else { 4 },
        offset: arch.offset,
        size: arch.size,
        align: arch.align,
    })
}
