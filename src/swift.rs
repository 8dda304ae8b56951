use std::sync::Arc;

use log::warn;
use num_derive::FromPrimitive;

use crate::cancel::CancelToken;
use crate::error::{DumpError, DumpResult};
use crate::macho::ImageView;

/// Context descriptor kinds, as stored in the low five flag bits.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ContextKind {
    Module = 0,
    Extension = 1,
    Anonymous = 2,
    Protocol = 3,
    OpaqueType = 4,
    Class = 16,
    Struct = 17,
    Enum = 18,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwiftTypeKind {
    Class,
    Struct,
    Enum,
    Extension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericSignature {
    pub num_params: u16,
    pub num_requirements: u16,
}

#[derive(Debug, Clone)]
pub struct SwiftType {
    pub kind: SwiftTypeKind,
    pub name: Arc<str>,
    pub module: Arc<str>,
    pub parent: Option<Arc<str>>,
    pub flags: u32,
    pub generic_signature: Option<GenericSignature>,
    pub field_descriptor_address: Option<u64>,
    pub address: u64,
}

#[derive(Debug, Clone)]
pub struct ProtocolRequirement {
    pub flags: u32,
    pub has_default_impl: bool,
}

#[derive(Debug, Clone)]
pub struct SwiftProtocol {
    pub name: Arc<str>,
    pub module: Arc<str>,
    pub parent: Option<Arc<str>>,
    pub flags: u32,
    pub requirements: Vec<ProtocolRequirement>,
    pub associated_types: Vec<String>,
    pub address: u64,
}

/// A reference out of a conformance record; the low bit of the stored
/// offset distinguishes direct from indirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConformanceRef {
    Direct(u64),
    Indirect(u64),
    Absent,
}

impl ConformanceRef {
    pub fn address(&self) -> Option<u64> {
        match self {
            ConformanceRef::Direct(addr) | ConformanceRef::Indirect(addr) => Some(*addr),
            ConformanceRef::Absent => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwiftConformance {
    pub conforming_type: ConformanceRef,
    pub protocol: ConformanceRef,
    pub retroactive: bool,
    pub conditional: bool,
    pub resilient: bool,
    pub witness_table_address: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SwiftField {
    pub name: String,
    pub mangled_type: String,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct SwiftFieldDescriptor {
    pub owning_type_mangled: String,
    pub superclass_mangled: Option<String>,
    pub kind: u16,
    pub fields: Vec<SwiftField>,
    pub address: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SwiftModel {
    pub types: Vec<SwiftType>,
    pub protocols: Vec<SwiftProtocol>,
    pub conformances: Vec<SwiftConformance>,
    pub field_descriptors: Vec<SwiftFieldDescriptor>,
}

impl SwiftModel {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.protocols.is_empty()
            && self.conformances.is_empty()
            && self.field_descriptors.is_empty()
    }
}

const GENERIC_FLAG: u32 = 0x80;
const KIND_MASK: u32 = 0x1f;
const MAX_PARENT_DEPTH: usize = 10;

/// Walks the `__swift5_*` reflection sections.
pub struct SwiftExtractor<'a> {
    view: &'a ImageView<'a>,
    cancel: CancelToken,
}

impl<'a> SwiftExtractor<'a> {
    pub fn new(view: &'a ImageView<'a>, cancel: CancelToken) -> Self {
        SwiftExtractor { view, cancel }
    }

    pub fn extract(&self) -> DumpResult<SwiftModel> {
        if !self.view.image.has_swift {
            return Ok(SwiftModel::default());
        }
        let mut model = SwiftModel {
            types: self.types()?,
            protocols: self.protocols()?,
            conformances: self.conformances()?,
            field_descriptors: self.field_descriptors()?,
        };
        model.types.sort_by(|a, b| {
            (a.name.as_ref(), a.address).cmp(&(b.name.as_ref(), b.address))
        });
        model.protocols.sort_by(|a, b| {
            (a.name.as_ref(), a.address).cmp(&(b.name.as_ref(), b.address))
        });
        Ok(model)
    }

    /// Read a signed 32-bit offset at `field_vm` and resolve it relative to
    /// the field's own address; 0 means absent.
    fn relative(&self, field_vm: u64) -> DumpResult<Option<u64>> {
        let offset = self.view.read_raw_u32(field_vm)? as i32;
        if offset == 0 {
            return Ok(None);
        }
        Ok(Some(field_vm.wrapping_add(offset as i64 as u64)))
    }

    /// Tagged variant: the low bit selects an indirect pointer that must be
    /// dereferenced.
    fn relative_tagged(&self, field_vm: u64) -> DumpResult<ConformanceRef> {
        let offset = self.view.read_raw_u32(field_vm)? as i32;
        if offset == 0 {
            return Ok(ConformanceRef::Absent);
        }
        let indirect = offset & 1 != 0;
        let target = field_vm.wrapping_add((offset & !1) as i64 as u64);
        if indirect {
            match self.view.image_value(target)?.address() {
                Some(addr) if addr != 0 => Ok(ConformanceRef::Indirect(addr)),
                _ => Ok(ConformanceRef::Absent),
            }
        } else {
            Ok(ConformanceRef::Direct(target))
        }
    }

    fn section_entries(&self, sectname: &str) -> Vec<u64> {
        let section = match self.view.image.section("__TEXT", sectname) {
            Some(section) => section,
            None => return Vec::new(),
        };
        let count = section.size / 4;
        let mut targets = Vec::with_capacity(count as usize);
        for i in 0..count {
            let field_vm = section.addr + i * 4;
            match self.relative_tagged(field_vm) {
                Ok(reference) => {
                    if let Some(addr) = reference.address() {
                        targets.push(addr);
                    }
                }
                Err(err) => warn!("{sectname}: entry {i}: {err}"),
            }
        }
        targets
    }

    fn types(&self) -> DumpResult<Vec<SwiftType>> {
        let mut types = Vec::new();
        for addr in self.section_entries("__swift5_types") {
            self.cancel.check()?;
            match self.parse_type_descriptor(addr) {
                Ok(Some(ty)) => types.push(ty),
                Ok(None) => {}
                Err(err) => warn!("__swift5_types: descriptor at {addr:#x}: {err}"),
            }
        }
        Ok(types)
    }

    fn protocols(&self) -> DumpResult<Vec<SwiftProtocol>> {
        let mut protocols = Vec::new();
        for addr in self.section_entries("__swift5_protos") {
            self.cancel.check()?;
            match self.parse_protocol_descriptor(addr) {
                Ok(proto) => protocols.push(proto),
                Err(err) => warn!("__swift5_protos: descriptor at {addr:#x}: {err}"),
            }
        }
        Ok(protocols)
    }

    fn conformances(&self) -> DumpResult<Vec<SwiftConformance>> {
        let mut conformances = Vec::new();
        for addr in self.section_entries("__swift5_proto") {
            self.cancel.check()?;
            match self.parse_conformance(addr) {
                Ok(conformance) => conformances.push(conformance),
                Err(err) => warn!("__swift5_proto: record at {addr:#x}: {err}"),
            }
        }
        Ok(conformances)
    }

    fn parse_type_descriptor(&self, addr: u64) -> DumpResult<Option<SwiftType>> {
        let flags = self.view.read_raw_u32(addr)?;
        let kind = match num::FromPrimitive::from_u32(flags & KIND_MASK) {
            Some(ContextKind::Class) => SwiftTypeKind::Class,
            Some(ContextKind::Struct) => SwiftTypeKind::Struct,
            Some(ContextKind::Enum) => SwiftTypeKind::Enum,
            Some(ContextKind::Extension) => SwiftTypeKind::Extension,
            // Protocols appear in __swift5_protos; anything else in the
            // type list is skipped rather than failed.
            _ => return Ok(None),
        };

        if kind == SwiftTypeKind::Extension {
            let (module, parent) = self.context_path(addr)?;
            return Ok(Some(SwiftType {
                kind,
                name: self.view.interner.intern("(extension)"),
                module,
                parent,
                flags,
                generic_signature: None,
                field_descriptor_address: None,
                address: addr,
            }));
        }

        let name_addr = self
            .relative(addr + 8)?
            .ok_or(DumpError::Unresolved(addr + 8))?;
        let name = self.view.interner.intern(self.view.cstr_vm(name_addr)?);
        let _access_function = self.relative(addr + 12)?;
        let field_descriptor_address = self.relative(addr + 16)?;
        let (module, parent) = self.context_path(addr)?;

        let generic_signature = if flags & GENERIC_FLAG != 0 {
            self.parse_generic_signature(addr, kind)
        } else {
            None
        };

        Ok(Some(SwiftType {
            kind,
            name,
            module,
            parent,
            flags,
            generic_signature,
            field_descriptor_address,
            address: addr,
        }))
    }

    fn parse_generic_signature(&self, addr: u64, kind: SwiftTypeKind) -> Option<GenericSignature> {
        // The generic context header trails the kind-specific fields.
        let header_off = match kind {
            SwiftTypeKind::Struct | SwiftTypeKind::Enum => 28,
            SwiftTypeKind::Class => 44,
            SwiftTypeKind::Extension => 12,
        };
        let mut cursor = self.view.cursor_at(addr + header_off, 4).ok()?;
        let num_params = cursor.read_u16().ok()?;
        let num_requirements = cursor.read_u16().ok()?;
        if num_params == 0 || num_params > 64 {
            return None;
        }
        Some(GenericSignature {
            num_params,
            num_requirements,
        })
    }

    /// Walk parent references up to the module, collecting nesting names.
    fn context_path(&self, addr: u64) -> DumpResult<(Arc<str>, Option<Arc<str>>)> {
        let mut module = self.view.interner.intern("");
        let mut nesting: Vec<String> = Vec::new();
        let mut current = self.relative(addr + 4)?;
        for _ in 0..MAX_PARENT_DEPTH {
            let parent_addr = match current {
                Some(parent_addr) => parent_addr,
                None => break,
            };
            let flags = self.view.read_raw_u32(parent_addr)?;
            match num::FromPrimitive::from_u32(flags & KIND_MASK) {
                Some(ContextKind::Module) => {
                    if let Some(name_addr) = self.relative(parent_addr + 8)? {
                        module = self.view.interner.intern(self.view.cstr_vm(name_addr)?);
                    }
                    break;
                }
                Some(ContextKind::Class)
                | Some(ContextKind::Struct)
                | Some(ContextKind::Enum)
                | Some(ContextKind::Protocol) => {
                    if let Some(name_addr) = self.relative(parent_addr + 8)? {
                        nesting.push(self.view.cstr_vm(name_addr)?.to_string());
                    }
                }
                _ => {}
            }
            current = self.relative(parent_addr + 4)?;
        }
        nesting.reverse();
        let parent = if nesting.is_empty() {
            None
        } else {
            Some(self.view.interner.intern(&nesting.join(".")))
        };
        Ok((module, parent))
    }

    fn parse_protocol_descriptor(&self, addr: u64) -> DumpResult<SwiftProtocol> {
        let flags = self.view.read_raw_u32(addr)?;
        let name_addr = self
            .relative(addr + 8)?
            .ok_or(DumpError::Unresolved(addr + 8))?;
        let name = self.view.interner.intern(self.view.cstr_vm(name_addr)?);
        let (module, parent) = self.context_path(addr)?;

        let _num_requirements_in_signature = self.view.read_raw_u32(addr + 12)?;
        let num_requirements = self.view.read_raw_u32(addr + 16)?;
        let associated_types = match self.relative(addr + 20)? {
            Some(names_addr) => self
                .view
                .cstr_vm(names_addr)?
                .split([' ', ','])
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            None => Vec::new(),
        };

        let mut requirements = Vec::new();
        if num_requirements < 4096 {
            for i in 0..num_requirements as u64 {
                let req_addr = addr + 24 + i * 8;
                let Ok(req_flags) = self.view.read_raw_u32(req_addr) else {
                    break;
                };
                let has_default_impl = matches!(self.relative(req_addr + 4), Ok(Some(_)));
                requirements.push(ProtocolRequirement {
                    flags: req_flags,
                    has_default_impl,
                });
            }
        } else {
            warn!("protocol at {addr:#x} claims {num_requirements} requirements");
        }

        Ok(SwiftProtocol {
            name,
            module,
            parent,
            flags,
            requirements,
            associated_types,
            address: addr,
        })
    }

    fn parse_conformance(&self, addr: u64) -> DumpResult<SwiftConformance> {
        let protocol = self.relative_tagged(addr)?;
        let conforming_type = self.relative_tagged(addr + 4)?;
        let witness_table_address = self.relative(addr + 8)?;
        let flags = self.view.read_raw_u32(addr + 12)?;

        Ok(SwiftConformance {
            conforming_type,
            protocol,
            retroactive: flags & (1 << 6) != 0,
            conditional: (flags >> 8) & 0xff != 0,
            resilient: flags & (1 << 16) != 0,
            witness_table_address,
        })
    }

    fn field_descriptors(&self) -> DumpResult<Vec<SwiftFieldDescriptor>> {
        let section = match self.view.image.section("__TEXT", "__swift5_fieldmd") {
            Some(section) => section,
            None => return Ok(Vec::new()),
        };
        let mut descriptors = Vec::new();
        let mut offset = 0u64;
        while offset + 16 <= section.size {
            self.cancel.check()?;
            let addr = section.addr + offset;
            match self.parse_field_descriptor(addr) {
                Ok((descriptor, advance)) => {
                    descriptors.push(descriptor);
                    offset += advance;
                }
                Err(err) => {
                    warn!("__swift5_fieldmd: descriptor at {addr:#x}: {err}");
                    break;
                }
            }
        }
        Ok(descriptors)
    }

    fn parse_field_descriptor(&self, addr: u64) -> DumpResult<(SwiftFieldDescriptor, u64)> {
        let owning_type_mangled = match self.relative(addr)? {
            Some(name_addr) => self.read_mangled_name(name_addr)?,
            None => String::new(),
        };
        let superclass_mangled = match self.relative(addr + 4)? {
            Some(name_addr) => Some(self.read_mangled_name(name_addr)?),
            None => None,
        };
        let mut cursor = self.view.cursor_at(addr + 8, 8)?;
        let kind = cursor.read_u16()?;
        let field_record_size = cursor.read_u16()? as u64;
        let num_fields = cursor.read_u32()? as u64;
        if field_record_size == 0 && num_fields > 0 || num_fields > 0x10000 {
            return Err(DumpError::Inconsistent(format!(
                "field descriptor at {addr:#x}: record size {field_record_size}, count {num_fields}"
            )));
        }

        let mut fields = Vec::with_capacity(num_fields as usize);
        for i in 0..num_fields {
            let record_addr = addr + 16 + i * field_record_size;
            let flags = self.view.read_raw_u32(record_addr)?;
            let mangled_type = match self.relative(record_addr + 4)? {
                Some(type_addr) => self.read_mangled_name(type_addr).unwrap_or_default(),
                None => String::new(),
            };
            let name = match self.relative(record_addr + 8)? {
                Some(name_addr) => self.view.cstr_vm(name_addr)?.to_string(),
                None => String::new(),
            };
            fields.push(SwiftField {
                name,
                mangled_type,
                flags,
            });
        }

        Ok((
            SwiftFieldDescriptor {
                owning_type_mangled,
                superclass_mangled,
                kind,
                fields,
                address: addr,
            },
            16 + num_fields * field_record_size,
        ))
    }

    /// Read a mangled name, resolving embedded symbolic references.
    ///
    /// Bytes 0x01..0x17 escape a relative reference; the resolver follows
    /// it one level and splices in the referenced descriptor's dotted name.
    /// Unknown reference kinds are preserved verbatim.
    pub fn read_mangled_name(&self, addr: u64) -> DumpResult<String> {
        let mut out = String::new();
        let mut vm = addr;
        loop {
            let byte = self.view.read_vm(vm, 1)?[0];
            match byte {
                0 => break,
                0x01 | 0x09 | 0x0a => {
                    let target = self.symbolic_target(vm + 1, false)?;
                    self.append_context_name(&mut out, target);
                    vm += 5;
                }
                0x02 | 0x0b | 0x0c => {
                    let target = self.symbolic_target(vm + 1, true)?;
                    self.append_context_name(&mut out, target);
                    vm += 5;
                }
                0x03..=0x17 => {
                    // Reserved kinds: keep the escape and its payload.
                    out.push(char::from(byte));
                    for i in 0..4 {
                        if let Ok(payload) = self.view.read_vm(vm + 1 + i, 1) {
                            out.push(char::from(payload[0]));
                        }
                    }
                    vm += 5;
                }
                other => {
                    out.push(char::from(other));
                    vm += 1;
                }
            }
            if out.len() > 4096 {
                return Err(DumpError::Inconsistent(format!(
                    "unterminated mangled name at {addr:#x}"
                )));
            }
        }
        Ok(out)
    }

    fn symbolic_target(&self, field_vm: u64, indirect: bool) -> DumpResult<Option<u64>> {
        let offset = self.view.read_raw_u32(field_vm)? as i32;
        let direct = field_vm.wrapping_add(offset as i64 as u64);
        if !indirect {
            return Ok(Some(direct));
        }
        Ok(self.view.image_value(direct)?.address().filter(|a| *a != 0))
    }

    fn append_context_name(&self, out: &mut String, target: Option<u64>) {
        let Some(ctx_addr) = target else {
            out.push('?');
            return;
        };
        match self.pretty_context_name(ctx_addr) {
            Ok(name) if !name.is_empty() => out.push_str(&name),
            _ => out.push('?'),
        }
    }

    /// `Module.Outer.Name` for a context descriptor.
    fn pretty_context_name(&self, ctx_addr: u64) -> DumpResult<String> {
        let name_addr = self
            .relative(ctx_addr + 8)?
            .ok_or(DumpError::Unresolved(ctx_addr + 8))?;
        let name = self.view.cstr_vm(name_addr)?;
        let (module, parent) = self.context_path(ctx_addr)?;
        let mut pretty = String::new();
        if !module.is_empty() {
            pretty.push_str(&module);
            pretty.push('.');
        }
        if let Some(parent) = parent {
            pretty.push_str(&parent);
            pretty.push('.');
        }
        pretty.push_str(name);
        Ok(pretty)
    }
}
