use std::sync::{Arc, OnceLock};

use log::warn;
use uuid::Uuid;

use crate::commands::{
    BuildVersionCommand, DylibCommand, EncryptionInfoCommand, EntryPointCommand,
    LinkeditDataCommand, LoadCommand, LoadCommandBase, SourceVersionCommand, VersionMinCommand,
};
use crate::error::{DumpError, DumpResult};
use crate::fat::ArchSlice;
use crate::fixups::{strip_raw_pointer, ChainedFixup, FixupTable};
use crate::header::{MHFlags, MachHeader};
use crate::intern::StringInterner;
use crate::reader::ByteCursor;
use crate::segment::{Section, Segment};
use crate::shared_cache::SharedCache;
use crate::source::ByteSource;
use crate::translate::AddressTranslator;

/// A library recorded by one of the `LC_*_DYLIB` commands.
#[derive(Debug, Clone)]
pub struct LinkedLibrary {
    pub name: String,
    pub weak: bool,
    pub timestamp: u32,
    pub current_version: u32,
    pub compat_version: u32,
}

impl From<&DylibCommand> for LinkedLibrary {
    fn from(cmd: &DylibCommand) -> Self {
        LinkedLibrary {
            name: cmd.name.clone(),
            weak: cmd.weak,
            timestamp: cmd.timestamp,
            current_version: cmd.current_version,
            compat_version: cmd.compat_version,
        }
    }
}

/// One fully parsed Mach-O slice: the hub every extractor works against.
#[derive(Debug)]
pub struct MachImage {
    pub header: MachHeader,
    pub load_commands: Vec<LoadCommand>,
    pub segments: Vec<Segment>,
    pub linked_libs: Vec<LinkedLibrary>,
    pub uuid: Option<Uuid>,
    pub build_version: Option<BuildVersionCommand>,
    pub version_min: Option<VersionMinCommand>,
    pub source_version: Option<SourceVersionCommand>,
    pub entry_point: Option<EntryPointCommand>,
    pub encryption_info: Option<EncryptionInfoCommand>,
    pub code_signature: Option<LinkeditDataCommand>,
    pub chained_fixups: Option<LinkeditDataCommand>,
    pub rpaths: Vec<String>,
    pub has_swift: bool,
    pub slice: ArchSlice,
}

impl MachImage {
    /// Parse the header and all load commands of one slice.
    ///
    /// A command whose declared size walks off the end of `sizeofcmds` is
    /// fatal for the slice; semantically odd but parseable commands (a
    /// second UUID, say) are logged and the first wins.
    pub fn parse(source: &dyn ByteSource, slice: ArchSlice) -> DumpResult<MachImage> {
        let data = source.read(slice.offset, slice.size as usize)?;
        let (_, header) = MachHeader::parse(data, slice.is64(), slice.byte_order)
            .map_err(|_| DumpError::InvalidInput("corrupt mach header".into()))?;

        let cmds_start = header.size() as usize;
        let cmds_end = cmds_start
            .checked_add(header.sizeofcmds as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                DumpError::InvalidInput(format!(
                    "sizeofcmds {:#x} exceeds slice size {:#x}",
                    header.sizeofcmds,
                    data.len()
                ))
            })?;
        let mut ldcmds = &data[cmds_start..cmds_end];

        let mut image = MachImage {
            header,
            load_commands: Vec::with_capacity(header.ncmds as usize),
            segments: Vec::new(),
            linked_libs: Vec::new(),
            uuid: None,
            build_version: None,
            version_min: None,
            source_version: None,
            entry_point: None,
            encryption_info: None,
            code_signature: None,
            chained_fixups: None,
            rpaths: Vec::new(),
            has_swift: false,
            slice,
        };

        for index in 0..header.ncmds {
            let (_, base) = LoadCommandBase::parse(ldcmds, slice.byte_order)
                .map_err(|_| DumpError::InvalidInput(format!("load command {index} truncated")))?;
            if (base.cmdsize as usize) < LoadCommandBase::SIZE
                || base.cmdsize as usize > ldcmds.len()
            {
                return Err(DumpError::InvalidInput(format!(
                    "load command {index} size {:#x} exceeds sizeofcmds",
                    base.cmdsize
                )));
            }
            let cmd_bytes = &ldcmds[..base.cmdsize as usize];
            let cmd = LoadCommand::parse(cmd_bytes, base, slice.is64(), slice.byte_order)?;
            image.record(&cmd);
            image.load_commands.push(cmd);
            ldcmds = &ldcmds[base.cmdsize as usize..];
        }

        let has_swift = image
            .sections()
            .any(|sect| sect.sectname.starts_with("__swift5_"));
        image.has_swift = has_swift;

        Ok(image)
    }

    fn record(&mut self, cmd: &LoadCommand) {
        match cmd {
            LoadCommand::Segment(seg) => self.segments.push(seg.clone()),
            LoadCommand::LoadDylib(dylib) => self.linked_libs.push(dylib.into()),
            LoadCommand::Uuid(uuid_cmd) => {
                if self.uuid.is_some() {
                    warn!("duplicate LC_UUID, keeping the first");
                } else {
                    self.uuid = Some(uuid_cmd.uuid);
                }
            }
            LoadCommand::BuildVersion(bv) => {
                if self.build_version.is_none() {
                    self.build_version = Some(bv.clone());
                }
            }
            LoadCommand::VersionMin(vm) => {
                if self.version_min.is_none() {
                    self.version_min = Some(*vm);
                }
            }
            LoadCommand::SourceVersion(sv) => self.source_version = Some(*sv),
            LoadCommand::Main(main) => self.entry_point = Some(*main),
            LoadCommand::EncryptionInfo(enc) => self.encryption_info = Some(*enc),
            LoadCommand::CodeSignature(cs) => self.code_signature = Some(*cs),
            LoadCommand::ChainedFixups(fixups) => self.chained_fixups = Some(*fixups),
            LoadCommand::Rpath(rpath) => self.rpaths.push(rpath.path.clone()),
            LoadCommand::IdDylib(_) | LoadCommand::Unknown(_) => {}
        }
    }

    pub fn is64(&self) -> bool {
        self.header.is64
    }

    pub fn pointer_size(&self) -> u64 {
        if self.is64() {
            8
        } else {
            4
        }
    }

    pub fn in_shared_cache(&self) -> bool {
        self.header.flags.contains(MHFlags::MH_DYLIB_IN_CACHE)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.segments.iter().flat_map(|seg| &seg.sections)
    }

    pub fn section(&self, segname: &str, sectname: &str) -> Option<&Section> {
        self.sections()
            .find(|sect| sect.segname == segname && sect.sectname == sectname)
    }

    /// ObjC metadata sections live in `__DATA` or `__DATA_CONST` depending
    /// on deployment target; the first that exists wins.
    pub fn objc_section(&self, sectname: &str) -> Option<&Section> {
        self.section("__DATA", sectname)
            .or_else(|| self.section("__DATA_CONST", sectname))
    }

    pub fn segment(&self, segname: &str) -> Option<&Segment> {
        self.segments.iter().find(|seg| seg.segname == segname)
    }

    /// Preferred load address: the first mapped segment that is not
    /// `__PAGEZERO`.
    pub fn base_vmaddr(&self) -> u64 {
        self.segments
            .iter()
            .find(|seg| seg.segname != "__PAGEZERO")
            .map(|seg| seg.vmaddr)
            .unwrap_or(0)
    }

    pub fn min_os_string(&self) -> Option<String> {
        if let Some(bv) = &self.build_version {
            return Some(format!("{} {}", bv.platform, bv.minos_string()));
        }
        self.version_min.as_ref().map(|vm| {
            format!(
                "{} {}",
                vm.platform,
                crate::helpers::version_string(vm.version)
            )
        })
    }
}

/// A pointer-sized value loaded from the image, after fixup decoding.
///
/// Binds only resolve to a symbol name: a cross-image reference cannot be
/// followed further without the target binary.
#[derive(Debug, Clone)]
pub enum ImageValue {
    Value(u64),
    Rebase(u64),
    Bind {
        name: Arc<str>,
        addend: i64,
        weak: bool,
    },
}

impl ImageValue {
    pub fn address(&self) -> Option<u64> {
        match self {
            ImageValue::Value(addr) | ImageValue::Rebase(addr) => Some(*addr),
            ImageValue::Bind { .. } => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ImageValue::Value(0))
    }
}

/// Borrowed read/decode context for one image: slice bytes, translation,
/// lazily parsed fixups, and the shared-cache surroundings when the image
/// lives inside one.
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub image: &'a MachImage,
    pub translator: AddressTranslator,
    pub interner: &'a StringInterner,
    pub cache: Option<&'a SharedCache>,
    fixups: OnceLock<Option<Arc<FixupTable>>>,
}

impl<'a> ImageView<'a> {
    pub fn new(
        data: &'a [u8],
        image: &'a MachImage,
        interner: &'a StringInterner,
        cache: Option<&'a SharedCache>,
    ) -> Self {
        ImageView {
            data,
            image,
            translator: AddressTranslator::from_segments(&image.segments),
            interner,
            cache,
            fixups: OnceLock::new(),
        }
    }

    /// The fixup table, parsed on first use. A parse failure is logged and
    /// remembered as absent; raw-pointer decoding still works without it.
    pub fn fixup_table(&self) -> Option<&FixupTable> {
        self.fixups
            .get_or_init(|| {
                match FixupTable::parse(self.data, self.image, &self.translator, self.interner) {
                    Ok(table) if !table.is_empty() || !table.imports.is_empty() => {
                        Some(Arc::new(table))
                    }
                    Ok(_) => None,
                    Err(err) => {
                        warn!("chained fixups unavailable: {err}");
                        None
                    }
                }
            })
            .as_deref()
    }

    pub fn read_vm(&self, vm: u64, len: usize) -> DumpResult<&'a [u8]> {
        if let Some(cache) = self.cache {
            return cache.read_vm(vm, len);
        }
        let off = self
            .translator
            .file_offset(vm)
            .ok_or(DumpError::Unresolved(vm))? as usize;
        self.data
            .get(off..off + len)
            .ok_or_else(|| DumpError::range(off as u64, len as u64, self.data.len() as u64))
    }

    pub fn cursor_at(&self, vm: u64, len: usize) -> DumpResult<ByteCursor<'a>> {
        Ok(ByteCursor::new(
            self.read_vm(vm, len)?,
            self.image.slice.byte_order,
        ))
    }

    /// Zero-copy C string at a virtual address, bounded by its mapping.
    pub fn cstr_vm(&self, vm: u64) -> DumpResult<&'a str> {
        if let Some(cache) = self.cache {
            return cache.cstr_vm(vm);
        }
        let span = self
            .translator
            .span_remaining(vm)
            .ok_or(DumpError::Unresolved(vm))?;
        let bytes = self.read_vm(vm, span as usize)?;
        let end = crate::source::find_null(bytes).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end])
            .map_err(|_| DumpError::Inconsistent(format!("non-UTF8 string at {vm:#x}")))
    }

    pub fn read_raw_u32(&self, vm: u64) -> DumpResult<u32> {
        let bytes = self.read_vm(vm, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_raw_u64(&self, vm: u64) -> DumpResult<u64> {
        let bytes = self.read_vm(vm, 8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn read_raw_ptr(&self, vm: u64) -> DumpResult<u64> {
        if self.image.is64() {
            self.read_raw_u64(vm)
        } else {
            self.read_raw_u32(vm).map(|v| v as u64)
        }
    }

    /// Load the pointer stored at `loc_vm` and decode it: chained-fixup
    /// entry first, then the shared-cache strategies, then tag stripping.
    pub fn image_value(&self, loc_vm: u64) -> DumpResult<ImageValue> {
        if let Some(table) = self.fixup_table() {
            if let Some(entry) = table.entry_at(loc_vm) {
                return match entry {
                    ChainedFixup::Rebase { target } => Ok(ImageValue::Rebase(*target)),
                    ChainedFixup::Bind { ordinal, addend } => match table.import(*ordinal) {
                        Some(import) => Ok(ImageValue::Bind {
                            name: import.name.clone(),
                            addend: *addend,
                            weak: import.weak,
                        }),
                        None => Err(DumpError::Unresolved(loc_vm)),
                    },
                };
            }
        }

        let raw = self.read_raw_ptr(loc_vm)?;
        if raw == 0 {
            return Ok(ImageValue::Value(0));
        }
        if let Some(cache) = self.cache {
            return Ok(ImageValue::Value(cache.decode_pointer(raw)));
        }
        if self.translator.contains(raw) {
            return Ok(ImageValue::Value(raw));
        }
        let stripped = strip_raw_pointer(raw);
        if self.translator.contains(stripped) {
            Ok(ImageValue::Value(stripped))
        } else {
            Ok(ImageValue::Value(raw))
        }
    }

    /// Decoded pointer that must resolve to an in-image address.
    pub fn pointer_vm(&self, loc_vm: u64) -> DumpResult<u64> {
        match self.image_value(loc_vm)? {
            ImageValue::Value(addr) | ImageValue::Rebase(addr) => Ok(addr),
            ImageValue::Bind { .. } => Err(DumpError::Unresolved(loc_vm)),
        }
    }

    pub fn contains_vm(&self, vm: u64) -> bool {
        match self.cache {
            Some(cache) => cache.contains_vm(vm),
            None => self.translator.contains(vm),
        }
    }

    /// Base address for small-method direct selectors inside a shared
    /// cache; `None` outside one or when the optimization header is absent.
    pub fn relative_selector_base(&self) -> Option<u64> {
        self.cache.and_then(|cache| cache.selector_base())
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::commands::testutil::{encode_base, encode_dylib, encode_uuid};
    use crate::commands::LCLoadCommand;
    use crate::fat::MH_MAGIC_64;
    use crate::header::MHFileType;
    use crate::machine::CpuType;
    use crate::reader::Endian;
    use crate::segment::testutil::encode_segment64;
    use crate::source::BufSource;

    /// Serialize a synthetic 64-bit little-endian image from segments plus
    /// extra command blobs; pads the file out to cover all segment extents.
    pub fn build_image(segments: &[Segment], extra_cmds: &[Vec<u8>], file_size: usize) -> Vec<u8> {
        let mut cmds = Vec::new();
        for seg in segments {
            let body = encode_segment64(seg);
            let mut cmd = encode_base(LCLoadCommand::LcSegment64 as u32, (body.len() + 8) as u32);
            cmd.extend_from_slice(&body);
            cmds.push(cmd);
        }
        cmds.extend_from_slice(extra_cmds);

        let sizeofcmds: usize = cmds.iter().map(|c| c.len()).sum();
        let mut buf = Vec::new();
        buf.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        buf.extend_from_slice(&(CpuType::Arm64 as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(MHFileType::MhDylib as u32).to_le_bytes());
        buf.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        for cmd in &cmds {
            buf.extend_from_slice(cmd);
        }
        if buf.len() < file_size {
            buf.resize(file_size, 0);
        }
        buf
    }

    pub fn image_slice(len: usize) -> ArchSlice {
        ArchSlice {
            cpu_type: CpuType::Arm64,
            cpu_subtype: crate::machine::CpuSubType::new(0),
            byte_order: Endian::Little,
            pointer_size: 8,
            offset: 0,
            size: len as u64,
            align: 14,
        }
    }

    pub fn parse_built(buf: Vec<u8>) -> (BufSource, MachImage) {
        let slice = image_slice(buf.len());
        let source = BufSource::new(buf);
        let image = MachImage::parse(&source, slice).unwrap();
        (source, image)
    }

    pub fn dylib_cmd(name: &str) -> Vec<u8> {
        encode_dylib(LCLoadCommand::LcLoadDylib as u32, name)
    }

    pub fn uuid_cmd(bytes: [u8; 16]) -> Vec<u8> {
        encode_uuid(bytes)
    }
}
