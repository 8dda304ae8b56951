use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use log::warn;
use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::error::{DumpError, DumpResult};
use crate::macho::{ImageValue, ImageView};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjCImageInfoFlags: u32 {
        const IS_REPLACEMENT = 1 << 0;
        const SUPPORTS_GC = 1 << 1;
        const REQUIRES_GC = 1 << 2;
        const OPTIMIZED_BY_DYLD = 1 << 3;
        const CORRECTED_SYNTHESIZE = 1 << 4;
        const IS_SIMULATED = 1 << 5;
        const HAS_CATEGORY_CLASS_PROPERTIES = 1 << 6;
        const OPTIMIZED_BY_DYLD_CLOSURE = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjCImageInfo {
    pub version: u32,
    pub flags: ObjCImageInfoFlags,
    pub swift_stable_version: u32,
    pub swift_unstable_version: u32,
}

impl ObjCImageInfo {
    pub const SWIFT_UNSTABLE_VERSION_MASK: u32 = 0xff << 8;
    pub const SWIFT_STABLE_VERSION_MASK: u32 = 0xff << 16;

    pub fn from_raw(version: u32, flags: u32) -> ObjCImageInfo {
        ObjCImageInfo {
            version,
            flags: ObjCImageInfoFlags::from_bits_truncate(flags),
            swift_stable_version: (flags & Self::SWIFT_STABLE_VERSION_MASK) >> 16,
            swift_unstable_version: (flags & Self::SWIFT_UNSTABLE_VERSION_MASK) >> 8,
        }
    }
}

/// Reference to a class that may live in another image: the fixup bind
/// only carries the symbol string, so an external superclass resolves to a
/// name and nothing more.
#[derive(Debug, Clone)]
pub enum ClassRef {
    Internal { address: u64 },
    External { name: Arc<str> },
}

impl ClassRef {
    /// `_OBJC_CLASS_$_NSObject` -> `NSObject`.
    pub fn display_name(&self) -> Option<&str> {
        match self {
            ClassRef::Internal { .. } => None,
            ClassRef::External { name } => Some(strip_class_symbol(name)),
        }
    }
}

pub fn strip_class_symbol(symbol: &str) -> &str {
    symbol
        .strip_prefix("_OBJC_CLASS_$_")
        .or_else(|| symbol.strip_prefix("_OBJC_METACLASS_$_"))
        .or_else(|| symbol.strip_prefix("_"))
        .unwrap_or(symbol)
}

#[derive(Debug, Clone)]
pub struct ObjCMethod {
    pub selector: Arc<str>,
    pub type_encoding: Arc<str>,
    pub imp: u64,
}

#[derive(Debug, Clone)]
pub struct ObjCIvar {
    pub name: Arc<str>,
    pub type_encoding: Arc<str>,
    pub offset: u64,
    pub size: u32,
    pub alignment: u32,
}

/// Parsed form of a property attribute string like
/// `T@"NSString",C,N,V_name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyAttributes {
    pub encoded_type: String,
    pub readonly: bool,
    pub copy: bool,
    pub nonatomic: bool,
    pub weak: bool,
    pub retain: bool,
    pub dynamic: bool,
    pub custom_getter: Option<String>,
    pub custom_setter: Option<String>,
    pub backing_ivar: Option<String>,
}

impl PropertyAttributes {
    /// Comma-separated single-letter tags; the `T` element may itself
    /// contain commas inside a quoted class list, so the split tracks
    /// quotes.
    pub fn parse(raw: &str) -> PropertyAttributes {
        let mut attrs = PropertyAttributes::default();
        for element in split_attributes(raw) {
            let mut chars = element.chars();
            match chars.next() {
                Some('T') => attrs.encoded_type = chars.as_str().to_string(),
                Some('t') => {
                    if attrs.encoded_type.is_empty() {
                        attrs.encoded_type = chars.as_str().to_string();
                    }
                }
                Some('R') => attrs.readonly = true,
                Some('C') => attrs.copy = true,
                Some('&') => attrs.retain = true,
                Some('W') => attrs.weak = true,
                Some('N') => attrs.nonatomic = true,
                Some('D') => attrs.dynamic = true,
                Some('G') => attrs.custom_getter = Some(chars.as_str().to_string()),
                Some('S') => attrs.custom_setter = Some(chars.as_str().to_string()),
                Some('V') => attrs.backing_ivar = Some(chars.as_str().to_string()),
                Some('P') | None => {}
                Some(other) => {
                    warn!("unknown property attribute tag {other:?} in {raw:?}");
                }
            }
        }
        attrs
    }

    pub fn getter_name(&self, property: &str) -> String {
        self.custom_getter
            .clone()
            .unwrap_or_else(|| property.to_string())
    }

    pub fn setter_name(&self, property: &str) -> String {
        self.custom_setter.clone().unwrap_or_else(|| {
            let mut chars = property.chars();
            match chars.next() {
                Some(first) => format!("set{}{}:", first.to_uppercase(), chars.as_str()),
                None => "set:".to_string(),
            }
        })
    }
}

fn split_attributes(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, byte) in raw.bytes().enumerate() {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                out.push(&raw[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start <= raw.len() {
        out.push(&raw[start..]);
    }
    out.retain(|e| !e.is_empty());
    out
}

#[derive(Debug, Clone)]
pub struct ObjCProperty {
    pub name: Arc<str>,
    pub raw_attributes: Arc<str>,
    pub parsed: PropertyAttributes,
}

#[derive(Debug, Clone)]
pub struct ObjCClass {
    pub name: Arc<str>,
    pub address: u64,
    pub superclass: Option<ClassRef>,
    pub is_swift: bool,
    pub instance_methods: Vec<ObjCMethod>,
    pub class_methods: Vec<ObjCMethod>,
    pub instance_vars: Vec<ObjCIvar>,
    pub properties: Vec<ObjCProperty>,
    pub adopted_protocols: Vec<Arc<str>>,
}

#[derive(Debug, Clone)]
pub struct ObjCProtocol {
    pub name: Arc<str>,
    pub address: u64,
    pub adopted: Vec<Arc<str>>,
    pub required_instance: Vec<ObjCMethod>,
    pub required_class: Vec<ObjCMethod>,
    pub optional_instance: Vec<ObjCMethod>,
    pub optional_class: Vec<ObjCMethod>,
    pub properties: Vec<ObjCProperty>,
}

#[derive(Debug, Clone)]
pub struct ObjCCategory {
    pub name: Arc<str>,
    pub address: u64,
    pub class_ref: ClassRef,
    pub instance_methods: Vec<ObjCMethod>,
    pub class_methods: Vec<ObjCMethod>,
    pub adopted: Vec<Arc<str>>,
    pub properties: Vec<ObjCProperty>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodListFlags: u32 {
        const UNIQUED = 1 << 0;
        const SORTED = 1 << 1;
        const SMALL = 0x80000000;
        const DIRECT_SELECTORS = 0x40000000;
    }
}

const METHOD_LIST_SIZE_MASK: u32 = 0x0000_FFFC;

/// Swift/stable-ABI bits in the low bits of `objc_class.data`.
const CLASS_DATA_MASK: u64 = 0x7;
const FAST_IS_SWIFT_LEGACY: u64 = 0x1;
const FAST_IS_SWIFT_STABLE: u64 = 0x2;

/// Defensive cap on protocol-list counts.
const MAX_PROTOCOL_COUNT: u64 = 10_000;

/// Traverses `__objc_classlist` / `__objc_protolist` / `__objc_catlist`.
///
/// Each per-object loader runs behind an error boundary: one corrupt class
/// is logged and skipped, the section walk continues. Only cancellation
/// aborts a walk.
pub struct ObjCExtractor<'a> {
    view: &'a ImageView<'a>,
    cancel: CancelToken,
    class_cache: Mutex<HashMap<u64, Arc<ObjCClass>>>,
    protocol_cache: Mutex<HashMap<u64, Arc<ObjCProtocol>>>,
}

impl<'a> ObjCExtractor<'a> {
    pub fn new(view: &'a ImageView<'a>, cancel: CancelToken) -> Self {
        ObjCExtractor {
            view,
            cancel,
            class_cache: Mutex::new(HashMap::new()),
            protocol_cache: Mutex::new(HashMap::new()),
        }
    }

    fn intern(&self, s: &str) -> Arc<str> {
        self.view.interner.intern(s)
    }

    /// Raw pointer-slot count of a list section, for coverage reporting.
    pub fn section_entry_count(&self, sectname: &str) -> usize {
        self.view
            .image
            .objc_section(sectname)
            .map(|section| (section.size / self.view.image.pointer_size()) as usize)
            .unwrap_or(0)
    }

    pub fn image_info(&self) -> Option<ObjCImageInfo> {
        let section = self.view.image.objc_section("__objc_imageinfo")?;
        let mut cursor = self.view.cursor_at(section.addr, 8).ok()?;
        let version = cursor.read_u32().ok()?;
        let flags = cursor.read_u32().ok()?;
        Some(ObjCImageInfo::from_raw(version, flags))
    }

    /// The decoded non-null pointers of a pointer-array section.
    fn walk_pointer_section(&self, sectname: &str) -> Vec<u64> {
        let section = match self.view.image.objc_section(sectname) {
            Some(section) => section,
            None => return Vec::new(),
        };
        let ptr_size = self.view.image.pointer_size();
        let count = section.size / ptr_size;
        let mut addrs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let loc = section.addr + i * ptr_size;
            match self.view.image_value(loc) {
                Ok(value) if value.is_null() => {}
                Ok(ImageValue::Value(addr)) | Ok(ImageValue::Rebase(addr)) => {
                    if addr != 0 {
                        addrs.push(addr)
                    }
                }
                Ok(ImageValue::Bind { .. }) => {}
                Err(err) => warn!("{sectname}: entry {i} undecodable: {err}"),
            }
        }
        addrs
    }

    /// Run `load` over every decoded entry of `sectname` in parallel,
    /// swallowing per-entry failures.
    fn walk<T, F>(&self, sectname: &str, load: F) -> DumpResult<Vec<T>>
    where
        T: Send,
        F: Fn(u64) -> DumpResult<T> + Sync,
    {
        let addrs = self.walk_pointer_section(sectname);
        let loaded = addrs
            .par_iter()
            .map(|addr| {
                self.cancel.check()?;
                match load(*addr) {
                    Ok(item) => Ok(Some(item)),
                    Err(DumpError::Cancelled) => Err(DumpError::Cancelled),
                    Err(err) => {
                        warn!("{sectname}: skipping object at {addr:#x}: {err}");
                        Ok(None)
                    }
                }
            })
            .collect::<DumpResult<Vec<_>>>()?;
        Ok(loaded.into_iter().flatten().collect())
    }

    pub fn classes(&self) -> DumpResult<Vec<ObjCClass>> {
        self.walk("__objc_classlist", |addr| {
            self.load_class(addr).map(|class| (*class).clone())
        })
    }

    pub fn protocols(&self) -> DumpResult<Vec<ObjCProtocol>> {
        self.walk("__objc_protolist", |addr| {
            self.load_protocol(addr).map(|proto| (*proto).clone())
        })
    }

    pub fn categories(&self) -> DumpResult<Vec<ObjCCategory>> {
        self.walk("__objc_catlist", |addr| self.load_category(addr))
    }

    /// Read `objc_class` and its `class_ro_t`, recursing into the
    /// metaclass for class methods.
    pub fn load_class(&self, address: u64) -> DumpResult<Arc<ObjCClass>> {
        if let Some(cached) = self.class_cache.lock().ok().and_then(|c| c.get(&address).cloned()) {
            return Ok(cached);
        }

        let (class, metaclass_addr) = self.load_class_half(address)?;

        let class_methods = match metaclass_addr {
            Some(meta_addr) if meta_addr != address => {
                match self.load_class_half(meta_addr) {
                    Ok((meta, _)) => meta.instance_methods,
                    Err(err) => {
                        warn!("metaclass of {:#x} unreadable: {err}", address);
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        let class = Arc::new(ObjCClass {
            class_methods,
            ..class
        });
        if let Ok(mut cache) = self.class_cache.lock() {
            cache.insert(address, class.clone());
        }
        Ok(class)
    }

    /// One level of the class structure, without metaclass recursion.
    fn load_class_half(&self, address: u64) -> DumpResult<(ObjCClass, Option<u64>)> {
        let view = self.view;
        let p = view.image.pointer_size();

        let isa = view.image_value(address)?;
        let superclass = view.image_value(address + p)?;
        // cache + vtable words are skipped; data holds the tagged ro
        // pointer. The Swift bits are flag bits, cleared before the address
        // is used.
        let data_ptr = view
            .image_value(address + 4 * p)?
            .address()
            .ok_or(DumpError::Unresolved(address + 4 * p))?;
        let is_swift = data_ptr & (FAST_IS_SWIFT_LEGACY | FAST_IS_SWIFT_STABLE) != 0;
        let ro_addr = data_ptr & !CLASS_DATA_MASK;
        if ro_addr == 0 {
            return Err(DumpError::Unresolved(address + 4 * p));
        }

        let ro = ClassRo::parse(view, ro_addr)?;
        let name = match ro.name {
            0 => self.intern(""),
            addr => self.intern(view.cstr_vm(addr)?),
        };

        let instance_methods = match ro.base_methods {
            0 => Vec::new(),
            addr => self.parse_method_list(addr)?,
        };
        let instance_vars = match ro.ivars {
            0 => Vec::new(),
            addr => self.parse_ivar_list(addr)?,
        };
        let properties = match ro.base_properties {
            0 => Vec::new(),
            addr => self.parse_property_list(addr)?,
        };
        let adopted_protocols = match ro.base_protocols {
            0 => Vec::new(),
            addr => self.parse_protocol_name_list(addr)?,
        };

        let superclass_ref = match superclass {
            ImageValue::Value(0) => None,
            ImageValue::Bind { name, .. } => Some(ClassRef::External { name }),
            ImageValue::Value(addr) | ImageValue::Rebase(addr) => {
                if view.contains_vm(addr) {
                    Some(ClassRef::Internal { address: addr })
                } else {
                    None
                }
            }
        };

        let metaclass_addr = isa.address().filter(|addr| *addr != 0);

        Ok((
            ObjCClass {
                name,
                address,
                superclass: superclass_ref,
                is_swift,
                instance_methods,
                class_methods: Vec::new(),
                instance_vars,
                properties,
                adopted_protocols,
            },
            metaclass_addr,
        ))
    }

    pub fn load_protocol(&self, address: u64) -> DumpResult<Arc<ObjCProtocol>> {
        if let Some(cached) = self
            .protocol_cache
            .lock()
            .ok()
            .and_then(|c| c.get(&address).cloned())
        {
            return Ok(cached);
        }

        let view = self.view;
        let p = view.image.pointer_size();

        // protocol_t: isa, mangledName, protocols, instanceMethods,
        // classMethods, optionalInstanceMethods, optionalClassMethods,
        // instanceProperties.
        let name_addr = view.pointer_vm(address + p)?;
        let name = self.intern(view.cstr_vm(name_addr)?);
        let adopted_addr = view.pointer_vm(address + 2 * p).unwrap_or(0);
        let required_instance = self.method_list_at(address + 3 * p)?;
        let required_class = self.method_list_at(address + 4 * p)?;
        let optional_instance = self.method_list_at(address + 5 * p)?;
        let optional_class = self.method_list_at(address + 6 * p)?;
        let properties = match view.pointer_vm(address + 7 * p).unwrap_or(0) {
            0 => Vec::new(),
            addr => self.parse_property_list(addr)?,
        };
        let adopted = match adopted_addr {
            0 => Vec::new(),
            addr => self.parse_protocol_name_list(addr)?,
        };

        let protocol = Arc::new(ObjCProtocol {
            name,
            address,
            adopted,
            required_instance,
            required_class,
            optional_instance,
            optional_class,
            properties,
        });
        if let Ok(mut cache) = self.protocol_cache.lock() {
            cache.insert(address, protocol.clone());
        }
        Ok(protocol)
    }

    pub fn load_category(&self, address: u64) -> DumpResult<ObjCCategory> {
        let view = self.view;
        let p = view.image.pointer_size();

        let name_addr = view.pointer_vm(address)?;
        let name = self.intern(view.cstr_vm(name_addr)?);
        let class_ref = match view.image_value(address + p)? {
            ImageValue::Bind { name, .. } => ClassRef::External { name },
            ImageValue::Value(addr) | ImageValue::Rebase(addr) => {
                ClassRef::Internal { address: addr }
            }
        };
        let instance_methods = self.method_list_at(address + 2 * p)?;
        let class_methods = self.method_list_at(address + 3 * p)?;
        let adopted = match view.pointer_vm(address + 4 * p).unwrap_or(0) {
            0 => Vec::new(),
            addr => self.parse_protocol_name_list(addr)?,
        };
        let properties = match view.pointer_vm(address + 5 * p).unwrap_or(0) {
            0 => Vec::new(),
            addr => self.parse_property_list(addr)?,
        };

        Ok(ObjCCategory {
            name,
            address,
            class_ref,
            instance_methods,
            class_methods,
            adopted,
            properties,
        })
    }

    /// Dereference a method-list pointer field, treating null as empty.
    fn method_list_at(&self, field_vm: u64) -> DumpResult<Vec<ObjCMethod>> {
        match self.view.pointer_vm(field_vm).unwrap_or(0) {
            0 => Ok(Vec::new()),
            addr => self.parse_method_list(addr),
        }
    }

    /// Parse an `entsize/count`-headed method list, in either the regular
    /// pointer format or the 12-byte relative one.
    pub fn parse_method_list(&self, list_vm: u64) -> DumpResult<Vec<ObjCMethod>> {
        let view = self.view;
        let mut header = view.cursor_at(list_vm, 8)?;
        let entsize_and_flags = header.read_u32()?;
        let count = header.read_u32()?;
        let flags = MethodListFlags::from_bits_truncate(entsize_and_flags);
        // Small-format entries are always 12 bytes; some emitters leave the
        // size bits zero and only set the flag.
        let entry_size = if flags.contains(MethodListFlags::SMALL) {
            12
        } else {
            (entsize_and_flags & METHOD_LIST_SIZE_MASK) as u64
        };
        if entry_size == 0 || count > 0x10000 {
            return Err(DumpError::Inconsistent(format!(
                "method list at {list_vm:#x}: entsize {entry_size}, count {count}"
            )));
        }

        let mut methods = if flags.contains(MethodListFlags::SMALL) {
            self.parse_small_methods(list_vm + 8, entry_size, count, flags)?
        } else {
            self.parse_regular_methods(list_vm + 8, entry_size, count)?
        };

        // On-disk order is the reverse of canonical enumeration order.
        methods.reverse();
        Ok(methods)
    }

    fn parse_regular_methods(
        &self,
        first_vm: u64,
        entry_size: u64,
        count: u32,
    ) -> DumpResult<Vec<ObjCMethod>> {
        let view = self.view;
        let p = view.image.pointer_size();
        let mut methods = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry_vm = first_vm + i as u64 * entry_size;
            let name_addr = match view.pointer_vm(entry_vm) {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("method entry at {entry_vm:#x}: {err}");
                    continue;
                }
            };
            let selector = match view.cstr_vm(name_addr) {
                Ok(s) => self.intern(s),
                Err(err) => {
                    warn!("selector at {name_addr:#x}: {err}");
                    continue;
                }
            };
            let type_encoding = view
                .pointer_vm(entry_vm + p)
                .ok()
                .and_then(|addr| view.cstr_vm(addr).ok())
                .map(|s| self.intern(s))
                .unwrap_or_else(|| self.intern(""));
            let imp = view.pointer_vm(entry_vm + 2 * p).unwrap_or(0);
            methods.push(ObjCMethod {
                selector,
                type_encoding,
                imp,
            });
        }
        Ok(methods)
    }

    /// 12-byte entries of `{name_off, types_off, imp_off}`, each offset
    /// relative to the address of its own field.
    fn parse_small_methods(
        &self,
        first_vm: u64,
        entry_size: u64,
        count: u32,
        flags: MethodListFlags,
    ) -> DumpResult<Vec<ObjCMethod>> {
        let view = self.view;
        let direct = flags.contains(MethodListFlags::DIRECT_SELECTORS);
        let selector_base = view.relative_selector_base();

        // In a shared cache, direct selector offsets are relative to the
        // optimization header's selector base. Without that base the
        // offsets are meaningless; an empty list beats garbled names.
        if direct && view.cache.is_some() && selector_base.is_none() {
            warn!("small direct-selector methods at {first_vm:#x} without a selector base");
            return Ok(Vec::new());
        }

        let mut methods = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry_vm = first_vm + i as u64 * entry_size;
            let mut cursor = match view.cursor_at(entry_vm, 12) {
                Ok(cursor) => cursor,
                Err(err) => {
                    warn!("small method entry at {entry_vm:#x}: {err}");
                    continue;
                }
            };
            let name_off = cursor.read_i32()? as i64;
            let types_off = cursor.read_i32()? as i64;
            let imp_off = cursor.read_i32()? as i64;

            let selector_vm = if direct {
                match selector_base {
                    Some(base) => base.wrapping_add(name_off as u64),
                    None => entry_vm.wrapping_add(name_off as u64),
                }
            } else {
                // The field points at a selector-reference slot which must
                // itself be decoded once.
                let slot_vm = entry_vm.wrapping_add(name_off as u64);
                match view.image_value(slot_vm) {
                    Ok(value) => match value.address().filter(|a| *a != 0) {
                        Some(addr) => addr,
                        None => slot_vm,
                    },
                    Err(_) => slot_vm,
                }
            };

            let selector = match view.cstr_vm(selector_vm) {
                Ok(s) => self.intern(s),
                Err(err) => {
                    warn!("small method selector at {selector_vm:#x}: {err}");
                    continue;
                }
            };
            let types_vm = entry_vm + 4;
            let type_encoding = view
                .cstr_vm(types_vm.wrapping_add(types_off as u64))
                .map(|s| self.intern(s))
                .unwrap_or_else(|_| self.intern(""));
            let imp = (entry_vm + 8).wrapping_add(imp_off as u64);
            methods.push(ObjCMethod {
                selector,
                type_encoding,
                imp,
            });
        }
        Ok(methods)
    }

    fn parse_ivar_list(&self, list_vm: u64) -> DumpResult<Vec<ObjCIvar>> {
        let view = self.view;
        let p = view.image.pointer_size();
        let mut header = view.cursor_at(list_vm, 8)?;
        let entsize = header.read_u32()? as u64;
        let count = header.read_u32()?;
        if entsize == 0 || count > 0x10000 {
            return Err(DumpError::Inconsistent(format!(
                "ivar list at {list_vm:#x}: entsize {entsize}, count {count}"
            )));
        }

        let mut ivars = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry_vm = list_vm + 8 + i as u64 * entsize;
            // The first field points at the location holding the actual
            // offset value, it is not the offset itself.
            let offset = match view.pointer_vm(entry_vm) {
                Ok(0) | Err(_) => 0,
                Ok(slot) => view.read_raw_u32(slot).unwrap_or(0) as u64,
            };
            let name = match view
                .pointer_vm(entry_vm + p)
                .and_then(|addr| view.cstr_vm(addr))
            {
                Ok(name) => self.intern(name),
                Err(err) => {
                    warn!("ivar entry at {entry_vm:#x}: {err}");
                    continue;
                }
            };
            let type_encoding = view
                .pointer_vm(entry_vm + 2 * p)
                .ok()
                .filter(|addr| *addr != 0)
                .and_then(|addr| view.cstr_vm(addr).ok())
                .map(|s| self.intern(s))
                .unwrap_or_else(|| self.intern(""));
            let mut tail = view.cursor_at(entry_vm + 3 * p, 8)?;
            let alignment = tail.read_u32()?;
            let size = tail.read_u32()?;
            ivars.push(ObjCIvar {
                name,
                type_encoding,
                offset,
                size,
                alignment,
            });
        }
        Ok(ivars)
    }

    fn parse_property_list(&self, list_vm: u64) -> DumpResult<Vec<ObjCProperty>> {
        let view = self.view;
        let p = view.image.pointer_size();
        let mut header = view.cursor_at(list_vm, 8)?;
        let entsize = header.read_u32()? as u64;
        let count = header.read_u32()?;
        if entsize < 2 * p || count > 0x10000 {
            return Err(DumpError::Inconsistent(format!(
                "property list at {list_vm:#x}: entsize {entsize}, count {count}"
            )));
        }

        let mut properties = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry_vm = list_vm + 8 + i as u64 * entsize;
            let name = match view
                .pointer_vm(entry_vm)
                .and_then(|addr| view.cstr_vm(addr))
            {
                Ok(name) => self.intern(name),
                Err(err) => {
                    warn!("property entry at {entry_vm:#x}: {err}");
                    continue;
                }
            };
            let raw_attributes = view
                .pointer_vm(entry_vm + p)
                .ok()
                .and_then(|addr| view.cstr_vm(addr).ok())
                .map(|s| self.intern(s))
                .unwrap_or_else(|| self.intern(""));
            let parsed = PropertyAttributes::parse(&raw_attributes);
            properties.push(ObjCProperty {
                name,
                raw_attributes,
                parsed,
            });
        }
        Ok(properties)
    }

    /// A protocol list: a pointer-sized count followed by that many
    /// protocol pointers; resolved to protocol names.
    fn parse_protocol_name_list(&self, list_vm: u64) -> DumpResult<Vec<Arc<str>>> {
        let view = self.view;
        let p = view.image.pointer_size();
        let count = view.read_raw_ptr(list_vm)?;
        if count == 0 || count >= MAX_PROTOCOL_COUNT {
            if count != 0 {
                warn!("protocol list at {list_vm:#x} claims {count} entries");
            }
            return Ok(Vec::new());
        }

        let mut names = Vec::with_capacity(count as usize);
        for i in 0..count {
            let proto_addr = match view.pointer_vm(list_vm + (1 + i) * p) {
                Ok(addr) if addr != 0 => addr,
                _ => continue,
            };
            // Only the name is needed here; full protocol bodies come from
            // the protolist walk.
            let name = view
                .pointer_vm(proto_addr + p)
                .and_then(|addr| view.cstr_vm(addr));
            match name {
                Ok(name) => names.push(self.intern(name)),
                Err(err) => warn!("protocol ref at {proto_addr:#x}: {err}"),
            }
        }
        Ok(names)
    }
}

/// The `class_ro_t` pointer fields this crate consumes.
struct ClassRo {
    name: u64,
    base_methods: u64,
    base_protocols: u64,
    ivars: u64,
    base_properties: u64,
}

impl ClassRo {
    fn parse(view: &ImageView<'_>, ro_addr: u64) -> DumpResult<ClassRo> {
        let p = view.image.pointer_size();
        let ivar_layout_off = if view.image.is64() { 16 } else { 12 };

        let mut head = view.cursor_at(ro_addr, 12)?;
        let _flags = head.read_u32()?;
        let _instance_start = head.read_u32()?;
        let _instance_size = head.read_u32()?;

        let fields = ro_addr + ivar_layout_off;
        let name = view.pointer_vm(fields + p).unwrap_or(0);
        let base_methods = view.pointer_vm(fields + 2 * p).unwrap_or(0);
        let base_protocols = view.pointer_vm(fields + 3 * p).unwrap_or(0);
        let ivars = view.pointer_vm(fields + 4 * p).unwrap_or(0);
        let base_properties = view.pointer_vm(fields + 6 * p).unwrap_or(0);

        Ok(ClassRo {
            name,
            base_methods,
            base_protocols,
            ivars,
            base_properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::{build_image, image_slice};
    use crate::macho::MachImage;
    use crate::segment::testutil::plain_segment;
    use crate::shared_cache::testutil::{build_cache_file, cache_from, TEST_REGION_BASE};
    use crate::source::{BufSource, ByteSource};

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_i32(buf: &mut [u8], off: usize, v: i32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Synthetic image where vm addresses equal file offsets: __TEXT covers
    /// the first page, __DATA the next two.
    fn test_image(fill: impl Fn(&mut Vec<u8>)) -> Vec<u8> {
        let text = plain_segment("__TEXT", 0, 0x1000, 0);
        let data = plain_segment("__DATA", 0x1000, 0x2000, 0x1000);
        let mut buf = build_image(&[text, data], &[], 0x3000);
        fill(&mut buf);
        buf
    }

    fn with_extractor<R>(buf: Vec<u8>, run: impl Fn(&ObjCExtractor<'_>) -> R) -> R {
        let slice = image_slice(buf.len());
        let source = BufSource::new(buf);
        let image = MachImage::parse(&source, slice).unwrap();
        let data = source.read(0, source.len()).unwrap();
        let interner = crate::intern::StringInterner::new();
        let view = ImageView::new(data, &image, &interner, None);
        let extractor = ObjCExtractor::new(&view, CancelToken::new());
        run(&extractor)
    }

    #[test]
    fn regular_method_list_is_reversed_and_stable() {
        let buf = test_image(|b| {
            put_u32(b, 0x1100, 24);
            put_u32(b, 0x1104, 2);
            // entry 0
            put_u64(b, 0x1108, 0x1200);
            put_u64(b, 0x1110, 0x1240);
            put_u64(b, 0x1118, 0x100);
            // entry 1
            put_u64(b, 0x1120, 0x1220);
            put_u64(b, 0x1128, 0x1240);
            put_u64(b, 0x1130, 0x200);
            b[0x1200..0x1206].copy_from_slice(b"first\0");
            b[0x1220..0x1227].copy_from_slice(b"second\0");
            b[0x1240..0x1248].copy_from_slice(b"v16@0:8\0");
        });
        with_extractor(buf, |extractor| {
            let once = extractor.parse_method_list(0x1100).unwrap();
            assert_eq!(once.len(), 2);
            assert_eq!(once[0].selector.as_ref(), "second");
            assert_eq!(once[1].selector.as_ref(), "first");
            assert_eq!(once[1].imp, 0x100);

            let twice = extractor.parse_method_list(0x1100).unwrap();
            let names: Vec<_> = twice.iter().map(|m| m.selector.as_ref()).collect();
            assert_eq!(names, ["second", "first"]);
        });
    }

    #[test]
    fn small_methods_with_direct_selectors() {
        let buf = test_image(|b| {
            put_u32(b, 0x1100, 0xC000_000C);
            put_u32(b, 0x1104, 1);
            // name field at 0x1108, selector stored directly at 0x1300
            put_i32(b, 0x1108, 0x1300 - 0x1108);
            put_i32(b, 0x110c, 0x1310 - 0x110c);
            put_i32(b, 0x1110, 0x200 - 0x1110);
            b[0x1300..0x1305].copy_from_slice(b"doIt\0");
            b[0x1310..0x1318].copy_from_slice(b"v16@0:8\0");
        });
        with_extractor(buf, |extractor| {
            let methods = extractor.parse_method_list(0x1100).unwrap();
            assert_eq!(methods.len(), 1);
            assert_eq!(methods[0].selector.as_ref(), "doIt");
            assert_eq!(methods[0].type_encoding.as_ref(), "v16@0:8");
            assert_eq!(methods[0].imp, 0x200);
        });
    }

    #[test]
    fn small_methods_with_indirect_selectors() {
        let buf = test_image(|b| {
            put_u32(b, 0x1100, 0x8000_000C);
            put_u32(b, 0x1104, 1);
            // name field points at a selector-reference slot, which in turn
            // holds the selector string's address.
            put_i32(b, 0x1108, 0x1400 - 0x1108);
            put_i32(b, 0x110c, 0x1310 - 0x110c);
            put_i32(b, 0x1110, 0x200 - 0x1110);
            put_u64(b, 0x1400, 0x1300);
            b[0x1300..0x1308].copy_from_slice(b"observe\0");
            b[0x1310..0x1318].copy_from_slice(b"v16@0:8\0");
        });
        with_extractor(buf, |extractor| {
            let methods = extractor.parse_method_list(0x1100).unwrap();
            assert_eq!(methods.len(), 1);
            assert_eq!(methods[0].selector.as_ref(), "observe");
        });
    }

    /// Shared-cache layout for the small-method selector-base cases: the
    /// method list sits in cache memory, the optimization header provides
    /// the base, and selector offsets are relative to that base.
    fn cache_with_small_methods(with_opt_header: bool) -> (Vec<u8>, u64) {
        let payload_base = 512 + 32;
        let mut file = build_cache_file(0x800);

        let list = payload_base; // file offset of the method list
        put_u32(&mut file, list, 0xC000_0003);
        put_u32(&mut file, list + 4, 1);
        let entry = list + 8;
        put_i32(&mut file, entry, 0x40);
        // types field is entry+4; the string lives at payload+0x380
        let types_str = payload_base + 0x380;
        put_i32(&mut file, entry + 4, (types_str - (entry + 4)) as i32);
        put_i32(&mut file, entry + 8, 0x100);
        file[types_str..types_str + 8].copy_from_slice(b"v16@0:8\0");

        let opt = payload_base + 0x200;
        if with_opt_header {
            // objc_opt_t v16 with the relative selector base at +0x100.
            put_u32(&mut file, opt, 16);
            put_u64(&mut file, opt + 40, 0x100);
            // header.objc_opt_offset
            put_u64(&mut file, 464, opt as u64);
        }
        // Selector pool: base is opt + 0x100, the entry's name_off is 0x40.
        let selector = opt + 0x100 + 0x40;
        file[selector..selector + 10].copy_from_slice(b"configure\0");

        (file, TEST_REGION_BASE + list as u64)
    }

    #[test]
    fn small_direct_selectors_use_cache_base() {
        let (file, list_vm) = cache_with_small_methods(true);
        let cache = cache_from(file);
        assert!(cache.selector_base().is_some());

        let image_buf = test_image(|_| {});
        let slice = image_slice(image_buf.len());
        let source = BufSource::new(image_buf);
        let image = MachImage::parse(&source, slice).unwrap();
        let data = source.read(0, source.len()).unwrap();
        let interner = crate::intern::StringInterner::new();
        let view = ImageView::new(data, &image, &interner, Some(&cache));
        let extractor = ObjCExtractor::new(&view, CancelToken::new());

        let methods = extractor.parse_method_list(list_vm).unwrap();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].selector.as_ref(), "configure");
        assert_eq!(methods[0].type_encoding.as_ref(), "v16@0:8");
    }

    #[test]
    fn small_direct_selectors_without_base_yield_empty_list() {
        let (file, list_vm) = cache_with_small_methods(false);
        let cache = cache_from(file);
        assert!(cache.selector_base().is_none());

        let image_buf = test_image(|_| {});
        let slice = image_slice(image_buf.len());
        let source = BufSource::new(image_buf);
        let image = MachImage::parse(&source, slice).unwrap();
        let data = source.read(0, source.len()).unwrap();
        let interner = crate::intern::StringInterner::new();
        let view = ImageView::new(data, &image, &interner, Some(&cache));
        let extractor = ObjCExtractor::new(&view, CancelToken::new());

        let methods = extractor.parse_method_list(list_vm).unwrap();
        assert!(methods.is_empty());
    }

    #[test]
    fn ivar_offsets_are_dereferenced() {
        let buf = test_image(|b| {
            put_u32(b, 0x1100, 32);
            put_u32(b, 0x1104, 1);
            put_u64(b, 0x1108, 0x1400); // offset slot pointer
            put_u64(b, 0x1110, 0x1300); // name
            put_u64(b, 0x1118, 0x1310); // type
            put_u32(b, 0x1120, 3); // alignment
            put_u32(b, 0x1124, 8); // size
            put_u32(b, 0x1400, 0x20); // the actual offset value
            b[0x1300..0x1307].copy_from_slice(b"_count\0");
            b[0x1310..0x1312].copy_from_slice(b"Q\0");
        });
        with_extractor(buf, |extractor| {
            let ivars = extractor.parse_ivar_list(0x1100).unwrap();
            assert_eq!(ivars.len(), 1);
            assert_eq!(ivars[0].name.as_ref(), "_count");
            assert_eq!(ivars[0].type_encoding.as_ref(), "Q");
            assert_eq!(ivars[0].offset, 0x20);
            assert_eq!(ivars[0].size, 8);
            assert_eq!(ivars[0].alignment, 3);
        });
    }

    #[test]
    fn property_attributes_full_parse() {
        let attrs = PropertyAttributes::parse("T@\"NSString\",C,N,V_name");
        assert_eq!(attrs.encoded_type, "@\"NSString\"");
        assert!(attrs.copy);
        assert!(attrs.nonatomic);
        assert!(!attrs.readonly);
        assert!(!attrs.weak);
        assert_eq!(attrs.backing_ivar.as_deref(), Some("_name"));
        assert_eq!(attrs.getter_name("name"), "name");
        assert_eq!(attrs.setter_name("name"), "setName:");
    }

    #[test]
    fn property_attributes_quoted_commas() {
        let attrs =
            PropertyAttributes::parse("T@\"NSDictionary<NSString *,NSNumber *>\",R,N,G_count");
        assert_eq!(attrs.encoded_type, "@\"NSDictionary<NSString *,NSNumber *>\"");
        assert!(attrs.readonly);
        assert_eq!(attrs.custom_getter.as_deref(), Some("_count"));
        assert_eq!(attrs.getter_name("count"), "_count");
    }

    #[test]
    fn property_attributes_retain_weak_dynamic() {
        let attrs = PropertyAttributes::parse("T@,&,D,W,SsetThing:");
        assert!(attrs.retain);
        assert!(attrs.weak);
        assert!(attrs.dynamic);
        assert_eq!(attrs.custom_setter.as_deref(), Some("setThing:"));
        assert_eq!(attrs.setter_name("thing"), "setThing:");
    }

    #[test]
    fn old_style_type_does_not_clobber() {
        let attrs = PropertyAttributes::parse("T@\"NSURL\",tq,R");
        assert_eq!(attrs.encoded_type, "@\"NSURL\"");
    }

    #[test]
    fn class_symbol_stripping() {
        assert_eq!(strip_class_symbol("_OBJC_CLASS_$_NSObject"), "NSObject");
        assert_eq!(
            strip_class_symbol("_OBJC_METACLASS_$_NSString"),
            "NSString"
        );
        assert_eq!(strip_class_symbol("_plainSymbol"), "plainSymbol");
        assert_eq!(strip_class_symbol("unprefixed"), "unprefixed");
    }

    #[test]
    fn image_info_versions() {
        let info = ObjCImageInfo::from_raw(0, (2 << 16) | (5 << 8) | 0x40);
        assert_eq!(info.swift_stable_version, 2);
        assert_eq!(info.swift_unstable_version, 5);
        assert!(info
            .flags
            .contains(ObjCImageInfoFlags::HAS_CATEGORY_CLASS_PROPERTIES));
    }
}
