use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

use crate::error::{DumpError, DumpResult};
use crate::fat::ArchSlice;
use crate::machine::{CpuSubType, CpuType};
use crate::reader::{ByteCursor, Endian};
use crate::segment::Protection;
use crate::source::{ByteSource, MmapSource};

/// The whole shared region spans 256 GiB from its base.
pub const SHARED_REGION_SPAN: u64 = 0x40_0000_0000;

const MAGIC_PREFIX: &str = "dyld_v1";

/// Architectures a cache magic can name, e.g. `dyld_v1   arm64e`.
pub fn arch_from_magic(magic: &str) -> DumpResult<(CpuType, CpuSubType)> {
    let arch = magic
        .strip_prefix(MAGIC_PREFIX)
        .ok_or_else(|| DumpError::InvalidInput(format!("not a shared cache: {magic:?}")))?
        .trim();
    match arch {
        "arm64" => Ok((CpuType::Arm64, CpuSubType::new(CpuSubType::ARM64_ALL))),
        "arm64e" => Ok((CpuType::Arm64, CpuSubType::new(CpuSubType::ARM64E))),
        "x86_64" => Ok((CpuType::X86_64, CpuSubType::new(3))),
        "x86_64h" => Ok((CpuType::X86_64, CpuSubType::new(8))),
        "armv7k" => Ok((CpuType::Arm, CpuSubType::new(12))),
        "arm64_32" => Ok((CpuType::Arm64_32, CpuSubType::new(1))),
        other => Err(DumpError::InvalidInput(format!(
            "unsupported cache architecture {other:?}"
        ))),
    }
}

/// The fields of `dyld_cache_header` this crate consumes.
///
/// The header has grown release over release; `mapping_offset` doubles as
/// the header size, so each field is only read when the header is big
/// enough to contain it.
#[derive(Debug, Clone, Default)]
pub struct CacheHeader {
    pub magic: String,
    pub mapping_offset: u32,
    pub mapping_count: u32,
    pub images_offset_old: u32,
    pub images_count_old: u32,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub slide_info_offset: u64,
    pub slide_info_size: u64,
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: Option<Uuid>,
    pub images_text_offset: u64,
    pub images_text_count: u64,
    pub shared_region_start: u64,
    pub shared_region_size: u64,
    pub sub_cache_array_offset: u32,
    pub sub_cache_array_count: u32,
    pub symbol_file_uuid: Option<Uuid>,
    pub images_offset: u32,
    pub images_count: u32,
    pub objc_opt_offset: u64,
    pub objc_opt_size: u64,
}

impl CacheHeader {
    const OFF_IMAGES_TEXT: usize = 136;
    const OFF_SHARED_REGION: usize = 224;
    const OFF_SUB_CACHES: usize = 392;
    const OFF_SYMBOL_FILE_UUID: usize = 400;
    const OFF_IMAGES_NEW: usize = 448;
    const OFF_OBJC_OPTS: usize = 464;

    pub fn parse(source: &dyn ByteSource) -> DumpResult<CacheHeader> {
        let magic_bytes = source.read(0, 16)?;
        let end = crate::source::find_null(magic_bytes).unwrap_or(16);
        let magic = std::str::from_utf8(&magic_bytes[..end])
            .map_err(|_| DumpError::InvalidInput("cache magic is not ASCII".into()))?
            .to_string();
        if !magic.starts_with(MAGIC_PREFIX) {
            return Err(DumpError::InvalidInput(format!(
                "not a shared cache: {magic:?}"
            )));
        }

        let mut header = CacheHeader {
            magic,
            ..CacheHeader::default()
        };

        let mut cursor = ByteCursor::new(source.read(0, source.len().min(512))?, Endian::Little);
        cursor.seek(16)?;
        header.mapping_offset = cursor.read_u32()?;
        header.mapping_count = cursor.read_u32()?;
        header.images_offset_old = cursor.read_u32()?;
        header.images_count_old = cursor.read_u32()?;
        let _dyld_base_address = cursor.read_u64()?;
        header.code_signature_offset = cursor.read_u64()?;
        header.code_signature_size = cursor.read_u64()?;
        header.slide_info_offset = cursor.read_u64()?;
        header.slide_info_size = cursor.read_u64()?;
        header.local_symbols_offset = cursor.read_u64()?;
        header.local_symbols_size = cursor.read_u64()?;
        let uuid_bytes = cursor.slice(88, 16)?;
        header.uuid = Some(Uuid::from_bytes(uuid_bytes.try_into().unwrap_or_default()));

        let size = header.mapping_offset as usize;
        if size > Self::OFF_IMAGES_TEXT + 16 {
            cursor.seek(Self::OFF_IMAGES_TEXT)?;
            header.images_text_offset = cursor.read_u64()?;
            header.images_text_count = cursor.read_u64()?;
        }
        if size > Self::OFF_SHARED_REGION + 16 {
            cursor.seek(Self::OFF_SHARED_REGION)?;
            header.shared_region_start = cursor.read_u64()?;
            header.shared_region_size = cursor.read_u64()?;
        }
        if size > Self::OFF_SUB_CACHES + 8 {
            cursor.seek(Self::OFF_SUB_CACHES)?;
            header.sub_cache_array_offset = cursor.read_u32()?;
            header.sub_cache_array_count = cursor.read_u32()?;
        }
        if size > Self::OFF_SYMBOL_FILE_UUID + 16 {
            let bytes = cursor.slice(Self::OFF_SYMBOL_FILE_UUID, 16)?;
            header.symbol_file_uuid =
                Some(Uuid::from_bytes(bytes.try_into().unwrap_or_default()));
        }
        if size > Self::OFF_IMAGES_NEW + 8 {
            cursor.seek(Self::OFF_IMAGES_NEW)?;
            header.images_offset = cursor.read_u32()?;
            header.images_count = cursor.read_u32()?;
        }
        if size > Self::OFF_OBJC_OPTS + 16 {
            cursor.seek(Self::OFF_OBJC_OPTS)?;
            header.objc_opt_offset = cursor.read_u64()?;
            header.objc_opt_size = cursor.read_u64()?;
        }

        Ok(header)
    }

    /// Sub-cache entries grew a file suffix at the same release that added
    /// the new image table.
    fn sub_cache_entry_size(&self) -> usize {
        if (self.mapping_offset as usize) > Self::OFF_IMAGES_NEW {
            56
        } else {
            24
        }
    }
}

/// One 32-byte `dyld_cache_mapping_info` entry.
#[derive(Debug, Clone, Copy)]
pub struct CacheMapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: Protection,
    pub init_prot: Protection,
}

impl CacheMapping {
    pub fn parse(cursor: &mut ByteCursor<'_>) -> DumpResult<CacheMapping> {
        Ok(CacheMapping {
            address: cursor.read_u64()?,
            size: cursor.read_u64()?,
            file_offset: cursor.read_u64()?,
            max_prot: Protection::from_bits_truncate(cursor.read_u32()?),
            init_prot: Protection::from_bits_truncate(cursor.read_u32()?),
        })
    }

    /// Conventional segment name, classified by initial protection.
    pub fn segment_name(&self) -> &'static str {
        if self.init_prot.contains(Protection::EXECUTE) {
            "__TEXT"
        } else if self.init_prot.contains(Protection::WRITE) {
            "__DATA"
        } else {
            "__LINKEDIT"
        }
    }
}

/// A dylib recorded in the cache's image table.
#[derive(Debug, Clone)]
pub struct CacheImageInfo {
    pub path: String,
    pub address: u64,
}

struct CacheFile {
    source: Box<dyn ByteSource>,
    mappings: Vec<CacheMapping>,
}

/// A parsed cache: the main file plus any `.01, .02, …` / `.symbols`
/// siblings, with one composite address translator across all of them.
pub struct SharedCache {
    files: Vec<CacheFile>,
    // (vm_start, vm_end, file index, file offset), sorted by vm_start.
    ranges: Vec<(u64, u64, usize, u64)>,
    pub header: CacheHeader,
    pub images: Vec<CacheImageInfo>,
    pub region_base: u64,
    pub region_size: u64,
    pub arch: (CpuType, CpuSubType),
    objc_opt: Option<ObjCOptInfo>,
}

#[derive(Debug, Clone, Copy)]
struct ObjCOptInfo {
    version: u32,
    selopt_offset: i32,
    opt_vm: u64,
    selector_base: Option<u64>,
}

impl SharedCache {
    pub fn open<P: AsRef<Path>>(path: P) -> DumpResult<SharedCache> {
        let path = path.as_ref();
        let main = MmapSource::open(path)?;
        let header = CacheHeader::parse(&main)?;

        let mut sources: Vec<Box<dyn ByteSource>> = vec![Box::new(main)];
        for sibling in Self::sibling_paths(path, &header)? {
            match MmapSource::open(&sibling) {
                Ok(source) => sources.push(Box::new(source)),
                Err(DumpError::FileNotFound(_))
                    if sibling.extension() == Some(std::ffi::OsStr::new("symbols")) =>
                {
                    debug!("no .symbols cache next to {}", path.display());
                }
                Err(err) => return Err(err),
            }
        }
        Self::from_sources(sources)
    }

    fn sibling_paths(path: &Path, header: &CacheHeader) -> DumpResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let base = path.to_string_lossy().into_owned();
        if header.sub_cache_array_count > 0 {
            // Suffixes recorded in the v2 entries are authoritative; the
            // numbered convention covers v1 caches.
            let main_source = MmapSource::open(path)?;
            let entry_size = header.sub_cache_entry_size();
            for index in 0..header.sub_cache_array_count {
                let entry_off =
                    header.sub_cache_array_offset as u64 + index as u64 * entry_size as u64;
                let suffix = if entry_size == 56 {
                    let bytes = main_source.read(entry_off + 24, 32)?;
                    let end = crate::source::find_null(bytes).unwrap_or(32);
                    String::from_utf8_lossy(&bytes[..end]).into_owned()
                } else {
                    format!(".{:02}", index + 1)
                };
                paths.push(PathBuf::from(format!("{base}{suffix}")));
            }
        }
        if header.symbol_file_uuid.is_some() {
            paths.push(PathBuf::from(format!("{base}.symbols")));
        }
        Ok(paths)
    }

    /// Assemble a cache from already-opened files (main file first). Used
    /// directly by tests; `open` feeds it mmapped siblings.
    pub fn from_sources(sources: Vec<Box<dyn ByteSource>>) -> DumpResult<SharedCache> {
        let main = sources
            .first()
            .ok_or_else(|| DumpError::InvalidInput("no cache files".into()))?;
        let header = CacheHeader::parse(main.as_ref())?;
        let arch = arch_from_magic(&header.magic)?;

        let mut files = Vec::with_capacity(sources.len());
        let mut ranges = Vec::new();
        for (idx, source) in sources.into_iter().enumerate() {
            let file_header = CacheHeader::parse(source.as_ref())?;
            let table = source.read(
                file_header.mapping_offset as u64,
                file_header.mapping_count as usize * 32,
            )?;
            let mut cursor = ByteCursor::new(table, Endian::Little);
            let mut mappings = Vec::with_capacity(file_header.mapping_count as usize);
            for _ in 0..file_header.mapping_count {
                let mapping = CacheMapping::parse(&mut cursor)?;
                ranges.push((
                    mapping.address,
                    mapping.address + mapping.size,
                    idx,
                    mapping.file_offset,
                ));
                mappings.push(mapping);
            }
            files.push(CacheFile { source, mappings });
        }
        ranges.sort_by_key(|(start, _, _, _)| *start);

        let region_base = if header.shared_region_start != 0 {
            header.shared_region_start
        } else {
            ranges.first().map(|(start, _, _, _)| *start).unwrap_or(0)
        };
        let region_size = if header.shared_region_size != 0 {
            header.shared_region_size
        } else {
            SHARED_REGION_SPAN
        };

        let mut cache = SharedCache {
            files,
            ranges,
            images: Vec::new(),
            region_base,
            region_size,
            arch,
            header,
            objc_opt: None,
        };
        cache.images = cache.parse_images()?;
        cache.objc_opt = cache.locate_objc_opt();
        Ok(cache)
    }

    fn parse_images(&self) -> DumpResult<Vec<CacheImageInfo>> {
        let header = &self.header;
        let main = &self.files[0].source;

        let (offset, count, entry) = if header.images_count > 0 {
            (header.images_offset as u64, header.images_count as u64, 32)
        } else if header.images_count_old > 0 {
            (
                header.images_offset_old as u64,
                header.images_count_old as u64,
                32,
            )
        } else {
            // Fall back to the TEXT image table.
            return self.parse_images_text();
        };

        let table = main.read(offset, (count * entry) as usize)?;
        let mut cursor = ByteCursor::new(table, Endian::Little);
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let address = cursor.read_u64()?;
            let _mod_time = cursor.read_u64()?;
            let _inode = cursor.read_u64()?;
            let path_offset = cursor.read_u32()?;
            let _pad = cursor.read_u32()?;
            let path = main.cstr(path_offset as u64)?.to_string();
            images.push(CacheImageInfo { path, address });
        }
        Ok(images)
    }

    fn parse_images_text(&self) -> DumpResult<Vec<CacheImageInfo>> {
        let header = &self.header;
        if header.images_text_count == 0 {
            return Ok(Vec::new());
        }
        let main = &self.files[0].source;
        let table = main.read(
            header.images_text_offset,
            header.images_text_count as usize * 32,
        )?;
        let mut cursor = ByteCursor::new(table, Endian::Little);
        let mut images = Vec::with_capacity(header.images_text_count as usize);
        for _ in 0..header.images_text_count {
            let _uuid = cursor.slice(cursor.position(), 16)?;
            cursor.skip(16)?;
            let load_address = cursor.read_u64()?;
            let _text_size = cursor.read_u32()?;
            let path_offset = cursor.read_u32()?;
            let path = main.cstr(path_offset as u64)?.to_string();
            images.push(CacheImageInfo {
                path,
                address: load_address,
            });
        }
        Ok(images)
    }

    pub fn image_named(&self, suffix: &str) -> Option<&CacheImageInfo> {
        self.images.iter().find(|image| image.path.ends_with(suffix))
    }

    /// Composite translation: binary search across the base ranges of all
    /// files, then per-file offset arithmetic.
    pub fn translate(&self, vm: u64) -> Option<(usize, u64)> {
        let idx = match self
            .ranges
            .binary_search_by_key(&vm, |(start, _, _, _)| *start)
        {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (start, end, file_idx, file_off) = self.ranges[idx];
        if vm < end {
            Some((file_idx, file_off + (vm - start)))
        } else {
            None
        }
    }

    pub fn contains_vm(&self, vm: u64) -> bool {
        self.translate(vm).is_some()
    }

    pub fn read_vm(&self, vm: u64, len: usize) -> DumpResult<&[u8]> {
        let (file_idx, off) = self.translate(vm).ok_or(DumpError::Unresolved(vm))?;
        self.files[file_idx].source.read(off, len)
    }

    pub fn cstr_vm(&self, vm: u64) -> DumpResult<&str> {
        let (file_idx, off) = self.translate(vm).ok_or(DumpError::Unresolved(vm))?;
        self.files[file_idx].source.cstr(off)
    }

    /// Decode an on-disk pointer found outside any fixup chain, per the
    /// three shared-cache strategies. Returns 0 when nothing maps.
    pub fn decode_pointer(&self, raw: u64) -> u64 {
        if raw == 0 {
            return 0;
        }
        if raw >= self.region_base
            && raw < self.region_base + SHARED_REGION_SPAN
            && self.contains_vm(raw)
        {
            return raw;
        }
        let candidate = self.region_base.wrapping_add(raw & 0xFFFF_FFFF);
        if self.contains_vm(candidate) {
            return candidate;
        }
        let candidate = self.region_base.wrapping_add(raw & 0x0007_FFFF_FFFF_FFFF);
        if self.contains_vm(candidate) {
            return candidate;
        }
        0
    }

    /// An `ArchSlice` for one image inside the cache, usable by the Mach-O
    /// parser against the owning file's bytes.
    pub fn image_slice(&self, image: &CacheImageInfo) -> DumpResult<(usize, ArchSlice)> {
        let (file_idx, off) = self
            .translate(image.address)
            .ok_or(DumpError::Unresolved(image.address))?;
        let source = &self.files[file_idx].source;
        let (cpu_type, cpu_subtype) = self.arch;
        Ok((
            file_idx,
            ArchSlice {
                cpu_type,
                cpu_subtype,
                byte_order: Endian::Little,
                pointer_size: if cpu_type.is64() { 8 } else { 4 },
                offset: off,
                size: source.len() as u64 - off,
                align: 14,
            },
        ))
    }

    pub fn file_source(&self, file_idx: usize) -> &dyn ByteSource {
        self.files[file_idx].source.as_ref()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Selector base for small-method direct selectors.
    pub fn selector_base(&self) -> Option<u64> {
        self.objc_opt.and_then(|opt| opt.selector_base)
    }

    /// Find the ObjC optimization header: at `objc_opt_offset` in older
    /// caches, inside libobjc's `__TEXT.__objc_opt_ro` in modern ones.
    fn locate_objc_opt(&self) -> Option<ObjCOptInfo> {
        let opt_vm = if self.header.objc_opt_offset != 0 {
            self.file_offset_to_vm(0, self.header.objc_opt_offset)?
        } else {
            self.objc_opt_via_libobjc()?
        };
        self.parse_objc_opt(opt_vm)
    }

    fn objc_opt_via_libobjc(&self) -> Option<u64> {
        let libobjc = self.image_named("/libobjc.A.dylib")?;
        let (file_idx, slice) = self.image_slice(libobjc).ok()?;
        let image =
            crate::macho::MachImage::parse(self.file_source(file_idx), slice).ok()?;
        let section = image.section("__TEXT", "__objc_opt_ro")?;
        Some(section.addr)
    }

    fn parse_objc_opt(&self, opt_vm: u64) -> Option<ObjCOptInfo> {
        let bytes = self.read_vm(opt_vm, 48).ok()?;
        let mut cursor = ByteCursor::new(bytes, Endian::Little);
        let version = cursor.read_u32().ok()?;
        let _flags = cursor.read_u32().ok()?;
        let selopt_offset = cursor.read_i32().ok()?;
        let _headeropt_ro = cursor.read_i32().ok()?;
        let _clsopt = cursor.read_i32().ok()?;
        let _protocolopt = cursor.read_i32().ok()?;
        let _headeropt_rw = cursor.read_i32().ok()?;
        let _protocolopt2 = cursor.read_i32().ok()?;
        let _large_class = cursor.read_i32().ok()?;
        let _large_protocol = cursor.read_i32().ok()?;
        let selector_base = if version >= 16 {
            let offset = cursor.read_i64().ok()?;
            let base = opt_vm.wrapping_add(offset as u64);
            if self.contains_vm(base) {
                Some(base)
            } else {
                warn!("relative selector base {base:#x} does not map, ignoring");
                None
            }
        } else {
            None
        };
        Some(ObjCOptInfo {
            version,
            selopt_offset,
            opt_vm,
            selector_base,
        })
    }

    fn file_offset_to_vm(&self, file_idx: usize, off: u64) -> Option<u64> {
        self.files[file_idx]
            .mappings
            .iter()
            .find(|m| off >= m.file_offset && off < m.file_offset + m.size)
            .map(|m| m.address + (off - m.file_offset))
    }

    /// The selector perfect-hash table, when the optimization header names
    /// one.
    pub fn selector_table(&self) -> Option<SelectorTable> {
        let opt = self.objc_opt?;
        if opt.selopt_offset == 0 {
            return None;
        }
        let table_vm = opt.opt_vm.wrapping_add(opt.selopt_offset as u64);
        match SelectorTable::parse(self, table_vm) {
            Ok(table) => Some(table),
            Err(err) => {
                warn!("selector table unavailable: {err}");
                None
            }
        }
    }

    pub fn objc_opt_version(&self) -> Option<u32> {
        self.objc_opt.map(|opt| opt.version)
    }
}

/// The shared selector string perfect-hash table.
///
/// Layout: `{capacity, occupied, shift, mask, salt}` (five 32-bit words),
/// a 256-byte scramble table, `capacity` 32-bit bucket offsets, then the
/// string pool. Bucket offsets are relative to the table base; zero means
/// empty.
pub struct SelectorTable {
    pub base_vm: u64,
    pub capacity: u32,
    pub occupied: u32,
    pub shift: u32,
    pub mask: u32,
    pub salt: u32,
    scramble: [u8; 256],
    offsets: Vec<u32>,
}

impl SelectorTable {
    const HEADER_SIZE: usize = 20;

    pub fn parse(cache: &SharedCache, table_vm: u64) -> DumpResult<SelectorTable> {
        let head = cache.read_vm(table_vm, Self::HEADER_SIZE + 256)?;
        let mut cursor = ByteCursor::new(head, Endian::Little);
        let capacity = cursor.read_u32()?;
        let occupied = cursor.read_u32()?;
        let shift = cursor.read_u32()?;
        let mask = cursor.read_u32()?;
        let salt = cursor.read_u32()?;
        if capacity == 0 || capacity > 0x0100_0000 {
            return Err(DumpError::Inconsistent(format!(
                "implausible selector table capacity {capacity}"
            )));
        }
        let mut scramble = [0u8; 256];
        scramble.copy_from_slice(cursor.slice(Self::HEADER_SIZE, 256)?);

        let offsets_bytes = cache.read_vm(
            table_vm + Self::HEADER_SIZE as u64 + 256,
            capacity as usize * 4,
        )?;
        let offsets = offsets_bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(SelectorTable {
            base_vm: table_vm,
            capacity,
            occupied,
            shift,
            mask,
            salt,
            scramble,
            offsets,
        })
    }

    fn hash(&self, name: &str) -> u64 {
        let mut h = 0u64;
        for byte in name.bytes() {
            h = (h >> 8) ^ self.scramble[((h ^ byte as u64) & 0xff) as usize] as u64;
        }
        h
    }

    /// VM address of the canonical selector string equal to `name`.
    pub fn lookup(&self, cache: &SharedCache, name: &str) -> Option<u64> {
        let index = (self.hash(name) >> self.shift) as u32 & self.mask;
        let offset = *self.offsets.get(index as usize)?;
        if offset == 0 {
            return None;
        }
        let vm = self.base_vm + offset as u64;
        match cache.cstr_vm(vm) {
            Ok(found) if found == name => Some(vm),
            _ => None,
        }
    }

    /// Every selector in the table, as `(vm address, string)`.
    pub fn enumerate(&self, cache: &SharedCache) -> Vec<(u64, String)> {
        let mut out = Vec::with_capacity(self.occupied as usize);
        for offset in &self.offsets {
            if *offset == 0 {
                continue;
            }
            let vm = self.base_vm + *offset as u64;
            if let Ok(name) = cache.cstr_vm(vm) {
                out.push((vm, name.to_string()));
            }
        }
        out
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::source::BufSource;

    pub const TEST_REGION_BASE: u64 = 0x1_8000_0000;

    /// A minimal single-file cache: header + one mapping that covers the
    /// whole file at `TEST_REGION_BASE`.
    pub fn build_cache_file(payload_len: usize) -> Vec<u8> {
        let mapping_offset = 512u32;
        let total = 512 + 32 + payload_len;
        let mut buf = vec![0u8; total];
        buf[..16].copy_from_slice(b"dyld_v1  arm64e\0");
        buf[16..20].copy_from_slice(&mapping_offset.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        // shared region start/size
        buf[224..232].copy_from_slice(&TEST_REGION_BASE.to_le_bytes());
        buf[232..240].copy_from_slice(&SHARED_REGION_SPAN.to_le_bytes());
        // one mapping: vm TEST_REGION_BASE, covers the whole file from 0
        let mut m = Vec::new();
        m.extend_from_slice(&TEST_REGION_BASE.to_le_bytes());
        m.extend_from_slice(&(total as u64).to_le_bytes());
        m.extend_from_slice(&0u64.to_le_bytes());
        m.extend_from_slice(&Protection::READ.bits().to_le_bytes());
        m.extend_from_slice(&Protection::READ.bits().to_le_bytes());
        buf[512..544].copy_from_slice(&m);
        buf
    }

    pub fn cache_from(buf: Vec<u8>) -> SharedCache {
        SharedCache::from_sources(vec![Box::new(BufSource::new(buf))]).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn arch_magics() {
        assert_eq!(
            arch_from_magic("dyld_v1   arm64").unwrap().0,
            CpuType::Arm64
        );
        assert_eq!(
            arch_from_magic("dyld_v1  arm64e").unwrap().1.value(),
            CpuSubType::ARM64E
        );
        assert_eq!(
            arch_from_magic("dyld_v1  x86_64").unwrap().0,
            CpuType::X86_64
        );
        assert!(arch_from_magic("dyld_v9  arm64e").is_err());
    }

    #[test]
    fn header_and_mapping_parse() {
        let cache = cache_from(build_cache_file(0x100));
        assert_eq!(cache.region_base, TEST_REGION_BASE);
        assert_eq!(cache.file_count(), 1);
        assert!(cache.contains_vm(TEST_REGION_BASE + 0x10));
        assert!(!cache.contains_vm(TEST_REGION_BASE + 0x4_0000));
        let (file_idx, off) = cache.translate(TEST_REGION_BASE + 0x40).unwrap();
        assert_eq!(file_idx, 0);
        assert_eq!(off, 0x40);
    }

    #[test]
    fn pointer_decode_strategy_order() {
        let cache = cache_from(build_cache_file(0x2000));
        // Strategy 1: a direct address inside the region.
        let direct = TEST_REGION_BASE + 0x100;
        assert_eq!(cache.decode_pointer(direct), direct);
        // Strategy 2: high bits garbage, low 32 bits are a region offset.
        let raw = 0xFFFF_FF80_0000_0123u64;
        assert_eq!(cache.decode_pointer(raw), TEST_REGION_BASE + 0x123);
        // Strategy 3 would need an offset past 4 GiB; with a tiny cache an
        // unmappable value decodes to zero.
        assert_eq!(cache.decode_pointer(0x7_4000_0000_0000), 0);
        assert_eq!(cache.decode_pointer(0), 0);
    }

    #[test]
    fn mapping_classification() {
        let exec = CacheMapping {
            address: 0,
            size: 0,
            file_offset: 0,
            max_prot: Protection::READ | Protection::EXECUTE,
            init_prot: Protection::READ | Protection::EXECUTE,
        };
        assert_eq!(exec.segment_name(), "__TEXT");
        let data = CacheMapping {
            init_prot: Protection::READ | Protection::WRITE,
            ..exec
        };
        assert_eq!(data.segment_name(), "__DATA");
        let linkedit = CacheMapping {
            init_prot: Protection::READ,
            ..exec
        };
        assert_eq!(linkedit.segment_name(), "__LINKEDIT");
    }

    #[test]
    fn selector_table_lookup_and_enumerate() {
        // Build a table with capacity 4, identity-ish scramble, and two
        // selectors placed by the same hash the implementation uses.
        let mut payload = vec![0u8; 0x400];
        let table_off = 0; // at payload start
        let capacity = 4u32;
        let shift = 0u32;
        let mask = 3u32;
        // Nonzero, as on real caches: the salt is carried in the header but
        // is not part of the hash seed.
        let salt = 0x5a17u32;
        payload[0..4].copy_from_slice(&capacity.to_le_bytes());
        payload[4..8].copy_from_slice(&2u32.to_le_bytes());
        payload[8..12].copy_from_slice(&shift.to_le_bytes());
        payload[12..16].copy_from_slice(&mask.to_le_bytes());
        payload[16..20].copy_from_slice(&salt.to_le_bytes());
        let mut scramble = [0u8; 256];
        for (i, slot) in scramble.iter_mut().enumerate() {
            *slot = i as u8;
        }
        payload[20..276].copy_from_slice(&scramble);

        // String pool after the offsets array.
        let strings_start = 20 + 256 + 4 * capacity as usize;
        let s1 = b"init\0";
        let s2 = b"dealloc\0";
        payload[strings_start..strings_start + s1.len()].copy_from_slice(s1);
        payload[strings_start + s1.len()..strings_start + s1.len() + s2.len()]
            .copy_from_slice(s2);

        // Compute buckets with the same hash function.
        let probe = SelectorTable {
            base_vm: 0,
            capacity,
            occupied: 2,
            shift,
            mask,
            salt,
            scramble,
            offsets: vec![0; capacity as usize],
        };
        let b1 = (probe.hash("init") >> shift) as u32 & mask;
        let b2 = (probe.hash("dealloc") >> shift) as u32 & mask;
        assert_ne!(b1, b2, "test selectors must not collide");
        let offsets_start = 20 + 256;
        let o1 = strings_start as u32;
        let o2 = (strings_start + s1.len()) as u32;
        payload[offsets_start + b1 as usize * 4..offsets_start + b1 as usize * 4 + 4]
            .copy_from_slice(&o1.to_le_bytes());
        payload[offsets_start + b2 as usize * 4..offsets_start + b2 as usize * 4 + 4]
            .copy_from_slice(&o2.to_le_bytes());

        let mut file = build_cache_file(payload.len());
        let payload_base = 512 + 32;
        file[payload_base..payload_base + payload.len()].copy_from_slice(&payload);
        let cache = cache_from(file);

        let table_vm = TEST_REGION_BASE + payload_base as u64 + table_off as u64;
        let table = SelectorTable::parse(&cache, table_vm).unwrap();
        assert_eq!(table.capacity, 4);
        assert_eq!(table.salt, 0x5a17);

        let found = table.lookup(&cache, "init").unwrap();
        assert_eq!(cache.cstr_vm(found).unwrap(), "init");
        assert!(table.lookup(&cache, "missingSelector:").is_none());

        let all = table.enumerate(&cache);
        let names: Vec<_> = all.iter().map(|(_, name)| name.as_str()).collect();
        assert!(names.contains(&"init"));
        assert!(names.contains(&"dealloc"));
    }
}
