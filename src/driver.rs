use std::sync::Arc;

use log::{debug, warn};

use crate::cancel::CancelToken;
use crate::demangle::Demangler;
use crate::encoding::{parse_encoding_cached, parse_method_encoding};
use crate::error::{DumpError, DumpResult};
use crate::fat;
use crate::intern::StringInterner;
use crate::machine::CpuType;
use crate::macho::{ImageView, MachImage};
use crate::objc::{
    ObjCCategory, ObjCClass, ObjCExtractor, ObjCImageInfo, ObjCProtocol,
};
use crate::registry::{MethodSignatureRegistry, SignatureSource, StructureRegistry};
use crate::shared_cache::SharedCache;
use crate::source::ByteSource;
use crate::swift::{SwiftExtractor, SwiftModel};

/// Shared state the driver is handed rather than reaching for globals: the
/// interner and the demangler (with its cache) are the only process-wide
/// stores, and both are explicit.
pub struct ProcessContext<'a> {
    pub interner: &'a StringInterner,
    pub demangler: &'a Demangler,
    pub cancel: CancelToken,
}

impl<'a> ProcessContext<'a> {
    pub fn new(interner: &'a StringInterner, demangler: &'a Demangler) -> Self {
        ProcessContext {
            interner,
            demangler,
            cancel: CancelToken::new(),
        }
    }
}

/// Best-effort coverage counters for one processed image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelStats {
    pub classes_seen: usize,
    pub classes_loaded: usize,
    pub protocols_seen: usize,
    pub protocols_loaded: usize,
    pub categories_seen: usize,
    pub categories_loaded: usize,
    pub swift_types: usize,
}

/// Everything extracted from one slice, ready for a renderer.
///
/// Collections are sorted by `(name, address)`; no ordering depends on how
/// the parallel walkers interleaved.
pub struct Model {
    pub image: MachImage,
    pub image_info: Option<ObjCImageInfo>,
    pub classes: Vec<ObjCClass>,
    pub protocols: Vec<ObjCProtocol>,
    pub categories: Vec<ObjCCategory>,
    pub swift: SwiftModel,
    pub structs: Arc<StructureRegistry>,
    pub signatures: Arc<MethodSignatureRegistry>,
    pub stats: ModelStats,
}

/// Process one thin/fat binary into a [`Model`].
pub fn process(
    source: &dyn ByteSource,
    preference: &[(CpuType, u32)],
    ctx: &ProcessContext<'_>,
) -> DumpResult<Model> {
    let slice = fat::select_slice(source, preference)?;
    let image = MachImage::parse(source, slice)?;
    let data = source.read(slice.offset, slice.size as usize)?;
    let extracted = {
        let view = ImageView::new(data, &image, ctx.interner, None);
        extract(&view, ctx)?
    };
    Ok(assemble(image, extracted, ctx))
}

/// Process one image embedded in a shared cache, addressed by a path
/// suffix such as `/CoreFoundation`.
pub fn process_cache_image(
    cache: &SharedCache,
    path_suffix: &str,
    ctx: &ProcessContext<'_>,
) -> DumpResult<Model> {
    let info = cache
        .image_named(path_suffix)
        .ok_or_else(|| {
            DumpError::InvalidInput(format!("no image matching {path_suffix:?} in cache"))
        })?
        .clone();
    debug!("processing {} at {:#x}", info.path, info.address);
    let (file_idx, slice) = cache.image_slice(&info)?;
    let file = cache.file_source(file_idx);
    let image = MachImage::parse(file, slice)?;
    let data = file.read_to_end(0)?;
    let extracted = {
        let view = ImageView::new(data, &image, ctx.interner, Some(cache));
        extract(&view, ctx)?
    };
    Ok(assemble(image, extracted, ctx))
}

struct Extracted {
    image_info: Option<ObjCImageInfo>,
    classes: Vec<ObjCClass>,
    protocols: Vec<ObjCProtocol>,
    categories: Vec<ObjCCategory>,
    swift: SwiftModel,
    stats: ModelStats,
}

/// The parallel collection phase: three ObjC walkers plus the Swift walker
/// fan out, and the joins double as the write barrier before the
/// registries are read.
fn extract(view: &ImageView<'_>, ctx: &ProcessContext<'_>) -> DumpResult<Extracted> {
    ctx.cancel.check()?;

    let objc = ObjCExtractor::new(view, ctx.cancel.clone());
    let swift = SwiftExtractor::new(view, ctx.cancel.clone());

    let ((protocols, categories), (classes, swift_model)) = rayon::join(
        || rayon::join(|| objc.protocols(), || objc.categories()),
        || rayon::join(|| objc.classes(), || swift.extract()),
    );
    let mut protocols = protocols?;
    let mut categories = categories?;
    let mut classes = classes?;
    let swift_model = swift_model?;

    // A cancel raised after the joins still discards the partial model.
    ctx.cancel.check()?;

    classes.sort_by(|a, b| (a.name.as_ref(), a.address).cmp(&(b.name.as_ref(), b.address)));
    protocols.sort_by(|a, b| (a.name.as_ref(), a.address).cmp(&(b.name.as_ref(), b.address)));
    categories.sort_by(|a, b| (a.name.as_ref(), a.address).cmp(&(b.name.as_ref(), b.address)));

    let stats = ModelStats {
        classes_seen: objc.section_entry_count("__objc_classlist"),
        classes_loaded: classes.len(),
        protocols_seen: objc.section_entry_count("__objc_protolist"),
        protocols_loaded: protocols.len(),
        categories_seen: objc.section_entry_count("__objc_catlist"),
        categories_loaded: categories.len(),
        swift_types: swift_model.types.len(),
    };

    Ok(Extracted {
        image_info: objc.image_info(),
        classes,
        protocols,
        categories,
        swift: swift_model,
        stats,
    })
}

fn assemble(image: MachImage, extracted: Extracted, ctx: &ProcessContext<'_>) -> Model {
    let structs = Arc::new(StructureRegistry::new());
    let signatures = Arc::new(MethodSignatureRegistry::new());

    for protocol in &extracted.protocols {
        for method in protocol
            .required_instance
            .iter()
            .chain(&protocol.required_class)
            .chain(&protocol.optional_instance)
            .chain(&protocol.optional_class)
        {
            signatures.register(
                &method.selector,
                &method.type_encoding,
                SignatureSource::Protocol(protocol.name.to_string()),
            );
            register_method_types(&structs, &method.type_encoding);
        }
        for property in &protocol.properties {
            register_encoding(&structs, &property.parsed.encoded_type);
        }
    }

    for class in &extracted.classes {
        for method in class.instance_methods.iter().chain(&class.class_methods) {
            signatures.register(
                &method.selector,
                &method.type_encoding,
                SignatureSource::Class(class.name.to_string()),
            );
            register_method_types(&structs, &method.type_encoding);
        }
        for ivar in &class.instance_vars {
            register_encoding(&structs, &ivar.type_encoding);
        }
        for property in &class.properties {
            register_encoding(&structs, &property.parsed.encoded_type);
        }
    }

    for category in &extracted.categories {
        for method in category
            .instance_methods
            .iter()
            .chain(&category.class_methods)
        {
            register_method_types(&structs, &method.type_encoding);
        }
        for property in &category.properties {
            register_encoding(&structs, &property.parsed.encoded_type);
        }
    }

    // Swift classes surface their mangled names through the ObjC runtime;
    // show them demangled.
    let classes = extracted
        .classes
        .into_iter()
        .map(|mut class| {
            if class.is_swift || crate::demangle::is_mangled(&class.name) {
                let demangled = ctx.demangler.demangle(&class.name);
                if demangled != class.name.as_ref() {
                    class.name = ctx.interner.intern(&demangled);
                }
            }
            class
        })
        .collect();

    Model {
        image,
        image_info: extracted.image_info,
        classes,
        protocols: extracted.protocols,
        categories: extracted.categories,
        swift: extracted.swift,
        structs,
        signatures,
        stats: extracted.stats,
    }
}

fn register_encoding(structs: &StructureRegistry, encoding: &str) {
    if encoding.is_empty() {
        return;
    }
    match parse_encoding_cached(encoding) {
        Ok(ty) => structs.register(&ty),
        Err(err) => warn!("unparseable encoding {encoding:?}: {err}"),
    }
}

fn register_method_types(structs: &StructureRegistry, encoding: &str) {
    if encoding.is_empty() {
        return;
    }
    match parse_method_encoding(encoding) {
        Ok(sig) => {
            for item in &sig.items {
                structs.register(&item.ty);
            }
        }
        Err(err) => debug!("unparseable method encoding {encoding:?}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::StringInterner;
    use crate::macho::testutil::{build_image, image_slice};
    use crate::segment::testutil::{plain_section, plain_segment};
    use crate::source::BufSource;

    fn context_parts() -> (StringInterner, Demangler) {
        (StringInterner::new(), Demangler::new())
    }

    /// A synthetic dylib with one class in `__objc_classlist`.
    fn one_class_image() -> Vec<u8> {
        // Layout (all vm == file offsets within the data segment):
        //   0x1000 class object      0x1060 name "Widget"
        //   0x1070 class_ro_t        0x10c0 method list
        //   0x1100 selector/type strings
        //   0x2000 classlist section (one pointer)
        let mut text = plain_segment("__TEXT", 0x0, 0x1000, 0x0);
        text.sections
            .push(plain_section("__TEXT", "__text", 0x100, 0x10, 0x100));
        let mut data = plain_segment("__DATA", 0x1000, 0x2000, 0x1000);
        data.sections.push(plain_section(
            "__DATA",
            "__objc_classlist",
            0x2000,
            8,
            0x2000,
        ));
        let mut buf = build_image(&[text, data], &[], 0x3000);

        let put_u64 = |buf: &mut Vec<u8>, off: usize, v: u64| {
            buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
        };
        let put_u32 = |buf: &mut Vec<u8>, off: usize, v: u32| {
            buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        };

        // classlist entry -> class at 0x1000
        put_u64(&mut buf, 0x2000, 0x1000);
        // class: isa=0, superclass=0, cache words, data=ro at 0x1070
        put_u64(&mut buf, 0x1000 + 32, 0x1070);
        // name string
        buf[0x1060..0x1067].copy_from_slice(b"Widget\0");
        // class_ro_t: flags, start, size, reserved, ivarLayout, name,
        // baseMethods
        put_u64(&mut buf, 0x1070 + 24, 0x1060);
        put_u64(&mut buf, 0x1070 + 32, 0x10c0);
        // method list: entsize 24, count 1, then {name, types, imp}
        put_u32(&mut buf, 0x10c0, 24);
        put_u32(&mut buf, 0x10c4, 1);
        put_u64(&mut buf, 0x10c8, 0x1100);
        put_u64(&mut buf, 0x10d0, 0x1110);
        put_u64(&mut buf, 0x10d8, 0x500);
        buf[0x1100..0x1105].copy_from_slice(b"play\0");
        buf[0x1110..0x1119].copy_from_slice(b"v16@0:8\0\0");
        buf
    }

    #[test]
    fn processes_synthetic_image() {
        let (interner, demangler) = context_parts();
        let ctx = ProcessContext::new(&interner, &demangler);
        let source = BufSource::new(one_class_image());
        let model = process(&source, &[], &ctx).unwrap();

        assert_eq!(model.classes.len(), 1);
        let class = &model.classes[0];
        assert_eq!(class.name.as_ref(), "Widget");
        assert_eq!(class.instance_methods.len(), 1);
        assert_eq!(class.instance_methods[0].selector.as_ref(), "play");
        assert_eq!(class.instance_methods[0].type_encoding.as_ref(), "v16@0:8");
        assert_eq!(class.instance_methods[0].imp, 0x500);
        assert_eq!(model.stats.classes_seen, 1);
        assert_eq!(model.stats.classes_loaded, 1);
        assert!(model.signatures.lookup("play").is_some());
    }

    #[test]
    fn cancelled_process_returns_no_model() {
        let (interner, demangler) = context_parts();
        let mut ctx = ProcessContext::new(&interner, &demangler);
        ctx.cancel = CancelToken::new();
        ctx.cancel.cancel();
        let source = BufSource::new(one_class_image());
        assert!(matches!(
            process(&source, &[], &ctx),
            Err(DumpError::Cancelled)
        ));
    }

    #[test]
    fn corrupt_class_entry_is_recovered() {
        let mut buf = one_class_image();
        // Grow the classlist section to two entries; the second points
        // nowhere. The walk should log and continue, keeping the good
        // class. The section size field sits inside the second segment
        // command: header (32) + text command (152) + data command base
        // (8) + segment body (64) + sectname/segname (32) + addr (8).
        let size_field = 32 + 152 + 8 + 64 + 32 + 8;
        buf[size_field..size_field + 8].copy_from_slice(&16u64.to_le_bytes());
        buf[0x2008..0x2010].copy_from_slice(&0xdead_beef_0000u64.to_le_bytes());
        let (interner, demangler) = context_parts();
        let ctx = ProcessContext::new(&interner, &demangler);
        let source = BufSource::new(buf);
        let model = process(&source, &[], &ctx).unwrap();
        assert_eq!(model.stats.classes_seen, 2);
        assert_eq!(model.classes.len(), 1);
    }

    #[test]
    fn empty_objc_sections_mean_empty_model() {
        let text = plain_segment("__TEXT", 0x0, 0x1000, 0x0);
        let buf = build_image(&[text], &[], 0x1000);
        let (interner, demangler) = context_parts();
        let ctx = ProcessContext::new(&interner, &demangler);
        let source = BufSource::new(buf);
        let model = process(&source, &[], &ctx).unwrap();
        assert!(model.classes.is_empty());
        assert!(model.protocols.is_empty());
        assert!(model.categories.is_empty());
        assert!(model.swift.is_empty());
    }

    #[test]
    fn slice_cursor_sanity() {
        // Guards the synthetic builder against layout drift.
        let buf = one_class_image();
        let slice = image_slice(buf.len());
        assert_eq!(slice.size as usize, buf.len());
    }
}
