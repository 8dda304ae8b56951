use std::collections::HashMap;
use std::sync::Arc;

use bitfield::bitfield;
use log::warn;
use nom_derive::{Nom, Parse};
use num_derive::FromPrimitive;

use crate::error::{DumpError, DumpResult};
use crate::intern::StringInterner;
use crate::macho::MachImage;
use crate::reader::{ByteCursor, Endian};
use crate::translate::AddressTranslator;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum PointerFormat {
    Arm64e = 1,
    Ptr64 = 2,
    Ptr32 = 3,
    Ptr64Offset = 6,
    Arm64eUserland = 9,
    Arm64eUserland24 = 12,
}

impl PointerFormat {
    /// Chain stride in bytes: the `next` field counts these.
    pub fn stride(&self) -> u64 {
        match self {
            PointerFormat::Arm64e
            | PointerFormat::Arm64eUserland
            | PointerFormat::Arm64eUserland24 => 8,
            PointerFormat::Ptr64 | PointerFormat::Ptr64Offset | PointerFormat::Ptr32 => 4,
        }
    }

    /// Whether rebase targets are offsets from the preferred base address
    /// rather than absolute unslid addresses.
    pub fn rebase_is_offset(&self) -> bool {
        matches!(
            self,
            PointerFormat::Ptr64Offset
                | PointerFormat::Arm64eUserland
                | PointerFormat::Arm64eUserland24
        )
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ImportFormat {
    Import = 1,
    ImportAddend = 2,
    ImportAddend64 = 3,
}

/// `dyld_chained_fixups_header`; the blob is little-endian on every
/// architecture that carries chained fixups.
#[derive(Debug, Clone, Copy, Nom)]
pub struct DyldChainedFixupsHeader {
    pub fixups_version: u32,
    pub starts_offset: u32,
    pub imports_offset: u32,
    pub symbols_offset: u32,
    pub imports_count: u32,
    pub imports_format: u32,
    pub symbols_format: u32,
}

bitfield! {
    pub struct DyldChainedPtr64RebaseBF(u64);
    impl Debug;
    pub target, _: 35, 0;
    pub high8, _: 43, 36;
    pub reserved, _: 50, 44;
    pub next, _: 62, 51;
    pub bind, _: 63;
}

bitfield! {
    pub struct DyldChainedPtr64BindBF(u64);
    impl Debug;
    pub ordinal, _: 23, 0;
    pub addend, _: 31, 24;
    pub reserved, _: 50, 32;
    pub next, _: 62, 51;
    pub bind, _: 63;
}

bitfield! {
    pub struct DyldChainedPtrArm64eRebaseBF(u64);
    impl Debug;
    pub target, _: 42, 0;
    pub high8, _: 50, 43;
    pub next, _: 61, 51;
    pub bind, _: 62;
    pub auth, _: 63;
}

bitfield! {
    pub struct DyldChainedPtrArm64eBindBF(u64);
    impl Debug;
    pub ordinal, _: 15, 0;
    pub zero, _: 31, 16;
    pub addend, _: 50, 32;
    pub next, _: 61, 51;
    pub bind, _: 62;
    pub auth, _: 63;
}

bitfield! {
    pub struct DyldChainedPtrArm64eBind24BF(u64);
    impl Debug;
    pub ordinal, _: 23, 0;
    pub zero, _: 31, 24;
    pub addend, _: 50, 32;
    pub next, _: 61, 51;
    pub bind, _: 62;
    pub auth, _: 63;
}

bitfield! {
    pub struct DyldChainedPtrArm64eAuthRebaseBF(u64);
    impl Debug;
    pub target, _: 31, 0;
    pub diversity, _: 47, 32;
    pub addr_div, _: 48;
    pub key, _: 50, 49;
    pub next, _: 61, 51;
    pub bind, _: 62;
    pub auth, _: 63;
}

bitfield! {
    pub struct DyldChainedPtrArm64eAuthBindBF(u64);
    impl Debug;
    pub ordinal, _: 15, 0;
    pub zero, _: 31, 16;
    pub diversity, _: 47, 32;
    pub addr_div, _: 48;
    pub key, _: 50, 49;
    pub next, _: 61, 51;
    pub bind, _: 62;
    pub auth, _: 63;
}

bitfield! {
    pub struct DyldChainedPtrArm64eAuthBind24BF(u64);
    impl Debug;
    pub ordinal, _: 23, 0;
    pub zero, _: 31, 24;
    pub diversity, _: 47, 32;
    pub addr_div, _: 48;
    pub key, _: 50, 49;
    pub next, _: 61, 51;
    pub bind, _: 62;
    pub auth, _: 63;
}

bitfield! {
    pub struct DyldChainedPtr32RebaseBF(u32);
    impl Debug;
    pub target, _: 25, 0;
    pub next, _: 30, 26;
    pub bind, _: 31;
}

bitfield! {
    pub struct DyldChainedPtr32BindBF(u32);
    impl Debug;
    pub ordinal, _: 19, 0;
    pub addend, _: 25, 20;
    pub next, _: 30, 26;
    pub bind, _: 31;
}

/// One decoded chain entry at a fixed location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainedFixup {
    Rebase { target: u64 },
    Bind { ordinal: u32, addend: i64 },
}

/// An entry of the imports table, with its name pulled from the symbols pool.
#[derive(Debug, Clone)]
pub struct ChainedImport {
    pub lib_ordinal: i32,
    pub weak: bool,
    pub name: Arc<str>,
}

/// The parsed `LC_DYLD_CHAINED_FIXUPS` payload of one image.
///
/// Built lazily on first query: images without ObjC metadata never pay for
/// the chain walk.
#[derive(Debug, Default)]
pub struct FixupTable {
    pub imports: Vec<ChainedImport>,
    entries: HashMap<u64, ChainedFixup>,
    pub page_count: usize,
}

impl FixupTable {
    /// Parse the fixups blob of `image` out of `data` (the slice bytes).
    pub fn parse(
        data: &[u8],
        image: &MachImage,
        translator: &AddressTranslator,
        interner: &StringInterner,
    ) -> DumpResult<FixupTable> {
        let blob_cmd = match image.chained_fixups {
            Some(cmd) => cmd,
            None => return Ok(FixupTable::default()),
        };
        let blob = data
            .get(blob_cmd.dataoff as usize..(blob_cmd.dataoff + blob_cmd.datasize) as usize)
            .ok_or_else(|| {
                DumpError::range(
                    blob_cmd.dataoff as u64,
                    blob_cmd.datasize as u64,
                    data.len() as u64,
                )
            })?;

        let (_, header) = DyldChainedFixupsHeader::parse_le(blob)
            .map_err(|_| DumpError::Inconsistent("truncated chained fixups header".into()))?;

        let imports_format: ImportFormat = num::FromPrimitive::from_u32(header.imports_format)
            .ok_or_else(|| {
                DumpError::Inconsistent(format!(
                    "unknown imports format {}",
                    header.imports_format
                ))
            })?;

        let imports = Self::parse_imports(
            blob,
            header.imports_offset,
            header.imports_count,
            imports_format,
            header.symbols_offset,
            interner,
        )?;

        let mut table = FixupTable {
            imports,
            entries: HashMap::new(),
            page_count: 0,
        };
        table.walk_starts(blob, header.starts_offset, data, image, translator)?;
        Ok(table)
    }

    fn parse_imports(
        blob: &[u8],
        imports_offset: u32,
        imports_count: u32,
        format: ImportFormat,
        symbols_offset: u32,
        interner: &StringInterner,
    ) -> DumpResult<Vec<ChainedImport>> {
        // 65536 import entries is already far beyond anything the linker
        // emits; treat bigger counts as corruption.
        if imports_count > 0x10000 {
            return Err(DumpError::Inconsistent(format!(
                "implausible import count {imports_count}"
            )));
        }
        let cursor = ByteCursor::new(blob, Endian::Little);
        let mut reader = ByteCursor::at(blob, imports_offset as usize, Endian::Little)?;
        let mut imports = Vec::with_capacity(imports_count as usize);
        for _ in 0..imports_count {
            let (lib_ordinal, weak, name_offset) = match format {
                ImportFormat::Import => {
                    let raw = reader.read_u32()?;
                    ((raw & 0xff) as i8 as i32, raw & 0x100 != 0, raw >> 9)
                }
                ImportFormat::ImportAddend => {
                    let raw = reader.read_u32()?;
                    let _addend = reader.read_i32()?;
                    ((raw & 0xff) as i8 as i32, raw & 0x100 != 0, raw >> 9)
                }
                ImportFormat::ImportAddend64 => {
                    let raw = reader.read_u64()?;
                    let _addend = reader.read_i64()?;
                    (
                        (raw & 0xffff) as i16 as i32,
                        raw & 0x10000 != 0,
                        (raw >> 32) as u32,
                    )
                }
            };
            let name = cursor
                .cstr(symbols_offset as usize + name_offset as usize)
                .unwrap_or("");
            imports.push(ChainedImport {
                lib_ordinal,
                weak,
                name: interner.intern(name),
            });
        }
        Ok(imports)
    }

    fn walk_starts(
        &mut self,
        blob: &[u8],
        starts_offset: u32,
        data: &[u8],
        image: &MachImage,
        translator: &AddressTranslator,
    ) -> DumpResult<()> {
        let mut starts = ByteCursor::at(blob, starts_offset as usize, Endian::Little)?;
        let seg_count = starts.read_u32()?;
        let mut seg_info_offsets = Vec::with_capacity(seg_count as usize);
        for _ in 0..seg_count {
            seg_info_offsets.push(starts.read_u32()?);
        }

        for seg_info_offset in seg_info_offsets {
            if seg_info_offset == 0 {
                continue;
            }
            let mut seg = ByteCursor::at(
                blob,
                starts_offset as usize + seg_info_offset as usize,
                Endian::Little,
            )?;
            let _size = seg.read_u32()?;
            let page_size = seg.read_u16()?;
            let pointer_format_raw = seg.read_u16()?;
            let segment_offset = seg.read_u64()?;
            let _max_valid_pointer = seg.read_u32()?;
            let page_count = seg.read_u16()?;

            let format: PointerFormat =
                match num::FromPrimitive::from_u16(pointer_format_raw) {
                    Some(format) => format,
                    None => {
                        warn!("unsupported chained pointer format {pointer_format_raw}, skipping segment");
                        continue;
                    }
                };

            for page_idx in 0..page_count {
                let page_start = seg.read_u16()?;
                const PAGE_START_NONE: u16 = 0xFFFF;
                if page_start == PAGE_START_NONE {
                    continue;
                }
                self.page_count += 1;
                let vm = image.base_vmaddr()
                    + segment_offset
                    + page_idx as u64 * page_size as u64
                    + page_start as u64;
                self.walk_chain(vm, format, data, image, translator);
            }
        }
        Ok(())
    }

    fn walk_chain(
        &mut self,
        start_vm: u64,
        format: PointerFormat,
        data: &[u8],
        image: &MachImage,
        translator: &AddressTranslator,
    ) {
        let base = image.base_vmaddr();
        let mut vm = start_vm;
        loop {
            let off = match translator.file_offset(vm) {
                Some(off) => off as usize,
                None => {
                    warn!("fixup chain walked to unmapped address {vm:#x}");
                    return;
                }
            };
            let raw64 = match data.get(off..off + 8) {
                Some(bytes) => u64::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
                    bytes[7],
                ]),
                None => return,
            };

            let ((fixup, next), auth) = match format {
                PointerFormat::Ptr64 | PointerFormat::Ptr64Offset => (decode_ptr64(raw64), false),
                PointerFormat::Arm64e | PointerFormat::Arm64eUserland => {
                    (decode_arm64e(raw64, false), raw64 >> 63 != 0)
                }
                PointerFormat::Arm64eUserland24 => (decode_arm64e(raw64, true), raw64 >> 63 != 0),
                PointerFormat::Ptr32 => (decode_ptr32(raw64 as u32), false),
            };

            // Authenticated rebase targets are always base-relative; plain
            // rebase targets are only for the offset-style formats.
            let fixup = match fixup {
                ChainedFixup::Rebase { target } if format.rebase_is_offset() || auth => {
                    ChainedFixup::Rebase {
                        target: base.wrapping_add(target),
                    }
                }
                other => other,
            };

            // Each location appears at most once; a revisit means the chain
            // loops and the walk stops there.
            if self.entries.insert(vm, fixup).is_some() {
                warn!("fixup chain cycle at {vm:#x}");
                return;
            }

            if next == 0 {
                return;
            }
            vm += next * format.stride();
        }
    }

    pub fn entry_at(&self, vm: u64) -> Option<&ChainedFixup> {
        self.entries.get(&vm)
    }

    pub fn import(&self, ordinal: u32) -> Option<&ChainedImport> {
        self.imports.get(ordinal as usize)
    }

    pub fn import_name(&self, ordinal: u32) -> Option<Arc<str>> {
        self.import(ordinal).map(|import| import.name.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode_ptr64(raw: u64) -> (ChainedFixup, u64) {
    if DyldChainedPtr64BindBF(raw).bind() {
        let bf = DyldChainedPtr64BindBF(raw);
        (
            ChainedFixup::Bind {
                ordinal: bf.ordinal() as u32,
                addend: bf.addend() as i64,
            },
            bf.next(),
        )
    } else {
        let bf = DyldChainedPtr64RebaseBF(raw);
        (
            ChainedFixup::Rebase {
                target: bf.target() | (bf.high8() << 56),
            },
            bf.next(),
        )
    }
}

fn decode_arm64e(raw: u64, wide_ordinal: bool) -> (ChainedFixup, u64) {
    let probe = DyldChainedPtrArm64eRebaseBF(raw);
    let (bind, auth) = (probe.bind(), probe.auth());
    match (bind, auth) {
        (true, true) => {
            if wide_ordinal {
                let bf = DyldChainedPtrArm64eAuthBind24BF(raw);
                (
                    ChainedFixup::Bind {
                        ordinal: bf.ordinal() as u32,
                        addend: 0,
                    },
                    bf.next(),
                )
            } else {
                let bf = DyldChainedPtrArm64eAuthBindBF(raw);
                (
                    ChainedFixup::Bind {
                        ordinal: bf.ordinal() as u32,
                        addend: 0,
                    },
                    bf.next(),
                )
            }
        }
        (true, false) => {
            if wide_ordinal {
                let bf = DyldChainedPtrArm64eBind24BF(raw);
                (
                    ChainedFixup::Bind {
                        ordinal: bf.ordinal() as u32,
                        addend: sign_extend19(bf.addend()),
                    },
                    bf.next(),
                )
            } else {
                let bf = DyldChainedPtrArm64eBindBF(raw);
                (
                    ChainedFixup::Bind {
                        ordinal: bf.ordinal() as u32,
                        addend: sign_extend19(bf.addend()),
                    },
                    bf.next(),
                )
            }
        }
        (false, true) => {
            let bf = DyldChainedPtrArm64eAuthRebaseBF(raw);
            // Auth rebase targets are always offsets from the image base;
            // the caller folds the base in for offset formats, so fold it
            // here only for the absolute arm64e format.
            (
                ChainedFixup::Rebase {
                    target: bf.target(),
                },
                bf.next(),
            )
        }
        (false, false) => {
            let bf = DyldChainedPtrArm64eRebaseBF(raw);
            (
                ChainedFixup::Rebase {
                    target: bf.target() | (bf.high8() << 56),
                },
                bf.next(),
            )
        }
    }
}

fn decode_ptr32(raw: u32) -> (ChainedFixup, u64) {
    if DyldChainedPtr32BindBF(raw).bind() {
        let bf = DyldChainedPtr32BindBF(raw);
        (
            ChainedFixup::Bind {
                ordinal: bf.ordinal(),
                addend: bf.addend() as i64,
            },
            bf.next() as u64,
        )
    } else {
        let bf = DyldChainedPtr32RebaseBF(raw);
        (
            ChainedFixup::Rebase {
                target: bf.target() as u64,
            },
            bf.next() as u64,
        )
    }
}

fn sign_extend19(value: u64) -> i64 {
    ((value as i64) << 45) >> 45
}

/// Strip the metadata bits a raw on-disk pointer may carry when the image
/// has no fixup entry for its location (PAC signature, tagged high byte).
pub fn strip_raw_pointer(raw: u64) -> u64 {
    raw & 0x0007_FFFF_FFFF_FFFF
}
