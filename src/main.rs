use std::env;
use std::process::ExitCode;

use classdump::driver::{process, process_cache_image, Model, ProcessContext};
use classdump::machine::{CpuSubType, CpuType};
use classdump::typefmt;
use classdump::{ByteSource, Demangler, DumpError, MmapSource, SharedCache, DEFAULT_INTERNER};

fn usage(program: &str) {
    eprintln!("Usage: {program} <file> [--arch <name>] [--image <path-suffix>] [--list-images]");
}

fn arch_preference(name: &str) -> Option<(CpuType, u32)> {
    match name {
        "arm64" => Some((CpuType::Arm64, 0)),
        "arm64e" => Some((CpuType::Arm64, CpuSubType::ARM64E)),
        "x86_64" => Some((CpuType::X86_64, 0)),
        "armv7" | "arm" => Some((CpuType::Arm, 0)),
        _ => None,
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
        return ExitCode::from(1);
    }

    let file_path = &args[1];
    let mut preference = Vec::new();
    let mut image_suffix: Option<String> = None;
    let mut list_images = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--arch" if i + 1 < args.len() => {
                i += 1;
                match arch_preference(&args[i]) {
                    Some(pref) => preference.push(pref),
                    None => {
                        eprintln!("unknown architecture {:?}", args[i]);
                        return ExitCode::from(1);
                    }
                }
            }
            "--image" if i + 1 < args.len() => {
                i += 1;
                image_suffix = Some(args[i].clone());
            }
            "--list-images" => list_images = true,
            other => {
                eprintln!("unknown argument {other:?}");
                usage(&args[0]);
                return ExitCode::from(1);
            }
        }
        i += 1;
    }

    match run(file_path, &preference, image_suffix.as_deref(), list_images) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(
    file_path: &str,
    preference: &[(CpuType, u32)],
    image_suffix: Option<&str>,
    list_images: bool,
) -> Result<(), DumpError> {
    let demangler = Demangler::new();
    let ctx = ProcessContext::new(&DEFAULT_INTERNER, &demangler);

    let source = MmapSource::open(file_path)?;
    let is_cache = source.read(0, 7).map(|magic| magic == b"dyld_v1").unwrap_or(false);

    let model = if is_cache {
        drop(source);
        let cache = SharedCache::open(file_path)?;
        if list_images || image_suffix.is_none() {
            for image in &cache.images {
                println!("{:#018x} {}", image.address, image.path);
            }
            return Ok(());
        }
        process_cache_image(&cache, image_suffix.unwrap_or_default(), &ctx)?
    } else {
        process(&source, preference, &ctx)?
    };

    render(&model, &demangler);
    Ok(())
}

fn render(model: &Model, demangler: &Demangler) {
    let image = &model.image;
    println!("// {} {}", image.slice.cpu_type.name(), match image.uuid {
        Some(uuid) => uuid.to_string(),
        None => "<no uuid>".to_string(),
    });
    if let Some(min_os) = image.min_os_string() {
        println!("// target {min_os}");
    }
    for lib in &image.linked_libs {
        println!(
            "// links {} ({})",
            lib.name,
            classdump::helpers::version_string(lib.current_version)
        );
    }
    println!();

    for protocol in &model.protocols {
        if protocol.adopted.is_empty() {
            println!("@protocol {}", protocol.name);
        } else {
            let adopted: Vec<&str> = protocol.adopted.iter().map(|p| p.as_ref()).collect();
            println!("@protocol {} <{}>", protocol.name, adopted.join(", "));
        }
        for property in &protocol.properties {
            println!("{}", typefmt::format_property(property));
        }
        for method in &protocol.required_class {
            println!("{}", typefmt::format_method(method, true, Some(&model.signatures)));
        }
        for method in &protocol.required_instance {
            println!("{}", typefmt::format_method(method, false, Some(&model.signatures)));
        }
        if !protocol.optional_instance.is_empty() || !protocol.optional_class.is_empty() {
            println!("@optional");
            for method in &protocol.optional_class {
                println!("{}", typefmt::format_method(method, true, Some(&model.signatures)));
            }
            for method in &protocol.optional_instance {
                println!("{}", typefmt::format_method(method, false, Some(&model.signatures)));
            }
        }
        println!("@end\n");
    }

    for class in &model.classes {
        let superclass = match &class.superclass {
            Some(super_ref) => match super_ref.display_name() {
                Some(name) => format!(" : {}", demangler.demangle(name)),
                None => " : ?".to_string(),
            },
            None => String::new(),
        };
        let protos = if class.adopted_protocols.is_empty() {
            String::new()
        } else {
            format!(
                " <{}>",
                class
                    .adopted_protocols
                    .iter()
                    .map(|p| p.as_ref())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!("@interface {}{superclass}{protos}", class.name);
        if !class.instance_vars.is_empty() {
            println!("{{");
            for ivar in &class.instance_vars {
                println!("    {}", typefmt::format_ivar(ivar, Some(&model.structs)));
            }
            println!("}}");
        }
        for property in &class.properties {
            println!("{}", typefmt::format_property(property));
        }
        for method in &class.class_methods {
            println!("{}", typefmt::format_method(method, true, Some(&model.signatures)));
        }
        for method in &class.instance_methods {
            println!("{}", typefmt::format_method(method, false, Some(&model.signatures)));
        }
        println!("@end\n");
    }

    for category in &model.categories {
        let class_name = match &category.class_ref {
            classdump::objc::ClassRef::External { name } => {
                demangler.demangle(classdump::objc::strip_class_symbol(name)).to_string()
            }
            classdump::objc::ClassRef::Internal { address } => model
                .classes
                .iter()
                .find(|class| class.address == *address)
                .map(|class| class.name.to_string())
                .unwrap_or_else(|| format!("{address:#x}")),
        };
        println!("@interface {class_name} ({})", category.name);
        for property in &category.properties {
            println!("{}", typefmt::format_property(property));
        }
        for method in &category.class_methods {
            println!("{}", typefmt::format_method(method, true, Some(&model.signatures)));
        }
        for method in &category.instance_methods {
            println!("{}", typefmt::format_method(method, false, Some(&model.signatures)));
        }
        println!("@end\n");
    }

    for ty in &model.swift.types {
        let keyword = match ty.kind {
            classdump::swift::SwiftTypeKind::Class => "class",
            classdump::swift::SwiftTypeKind::Struct => "struct",
            classdump::swift::SwiftTypeKind::Enum => "enum",
            classdump::swift::SwiftTypeKind::Extension => "extension",
        };
        let qualified = match (&ty.module, &ty.parent) {
            (module, Some(parent)) if !module.is_empty() => {
                format!("{module}.{parent}.{}", ty.name)
            }
            (module, None) if !module.is_empty() => format!("{module}.{}", ty.name),
            _ => ty.name.to_string(),
        };
        let generics = match ty.generic_signature {
            Some(sig) => {
                let params: Vec<String> = (0..sig.num_params)
                    .map(|i| format!("{}", (b'A' + (i % 26) as u8) as char))
                    .collect();
                format!("<{}>", params.join(", "))
            }
            None => String::new(),
        };
        println!("{keyword} {qualified}{generics}");
        if let Some(fields) = model
            .swift
            .field_descriptors
            .iter()
            .find(|fd| Some(fd.address) == ty.field_descriptor_address)
        {
            for field in &fields.fields {
                println!("    {}: {}", field.name, demangler.demangle(&field.mangled_type));
            }
        }
        println!();
    }

    eprintln!(
        "// classes {}/{} protocols {}/{} categories {}/{} swift types {}",
        model.stats.classes_loaded,
        model.stats.classes_seen,
        model.stats.protocols_loaded,
        model.stats.protocols_seen,
        model.stats.categories_loaded,
        model.stats.categories_seen,
        model.stats.swift_types,
    );
}
